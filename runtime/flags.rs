// Copyright 2018-2026 the Vela authors. MIT license.

use crate::settings::Settings;

/// Instruct the VM to ignore unrecognized flags. Always first: there is a
/// lot of diversity in the flag combinations the VM supports across
/// platforms and versions, and a VM that comes across a flag it does not
/// recognize exits immediately.
const IGNORE_UNRECOGNIZED_FLAGS: &str = "--ignore-unrecognized-flags";

// The VM assumes ARM devices are insufficiently powerful and sets the
// default profile period low; that number is far too conservative for
// current hardware. On platforms where LLDB is the primary debugger,
// SIGPROF signals overwhelm it, so the profiler is disabled outright.
#[cfg(any(target_os = "ios", target_os = "macos"))]
const PROFILING_FLAGS: &[&str] = &["--profile_period=1000", "--no-profiler"];
#[cfg(not(any(target_os = "ios", target_os = "macos")))]
const PROFILING_FLAGS: &[&str] = &["--profile_period=1000"];

// Reflection is unused by hosted applications; disabling it saves footprint.
const MIRRORS_FLAGS: &[&str] = &["--enable_mirrors=false"];

const BACKGROUND_COMPILATION_FLAGS: &[&str] = &["--background_compilation"];

const PRECOMPILATION_FLAGS: &[&str] = &["--precompilation"];

const CHECKED_MODE_FLAGS: &[&str] = &[
  "--enable_asserts",
  "--enable_type_checks",
  "--error_on_bad_type",
  "--error_on_bad_override",
];

const START_PAUSED_FLAGS: &[&str] = &["--pause_isolates_on_start"];

const TRACE_STARTUP_FLAGS: &[&str] = &[
  "--timeline_streams=Compiler,VM,Embedder,GC",
  "--timeline_recorder=endless",
];

/// Checked mode is never enabled on precompiled code; even snapshot
/// generation strips checked-mode arguments. Otherwise the `strict` build
/// feature forces it on, and the host setting decides the rest.
pub fn should_enable_checked_mode(
  precompiled: bool,
  settings: &Settings,
) -> bool {
  if precompiled {
    return false;
  }
  if cfg!(feature = "strict") {
    return true;
  }
  settings.checked_mode
}

/// Assembles the startup flag vector in its required order. The VM resolves
/// duplicates last-wins, so the host's extra flags go last and can override
/// any default before them.
pub fn compose_flags(precompiled: bool, settings: &Settings) -> Vec<String> {
  let mut args: Vec<String> = Vec::new();

  args.push(IGNORE_UNRECOGNIZED_FLAGS.to_string());

  extend(&mut args, PROFILING_FLAGS);
  extend(&mut args, MIRRORS_FLAGS);
  extend(&mut args, BACKGROUND_COMPILATION_FLAGS);

  if precompiled {
    extend(&mut args, PRECOMPILATION_FLAGS);
  }

  if should_enable_checked_mode(precompiled, settings) {
    extend(&mut args, CHECKED_MODE_FLAGS);
  }

  if settings.start_paused {
    extend(&mut args, START_PAUSED_FLAGS);
  }

  if settings.trace_startup {
    extend(&mut args, TRACE_STARTUP_FLAGS);
  }

  if let Some(extra) = &settings.extra_flags {
    args.extend(extra.split_whitespace().map(String::from));
  }

  args
}

fn extend(args: &mut Vec<String>, flags: &[&str]) {
  args.extend(flags.iter().map(|f| f.to_string()));
}

#[cfg(test)]
mod tests {
  use super::*;

  fn flag_set(precompiled: bool, settings: &Settings) -> Vec<String> {
    compose_flags(precompiled, settings)
  }

  #[test]
  fn ignore_unrecognized_is_always_first() {
    let combos = [
      (false, Settings::default()),
      (true, Settings::default()),
      (
        false,
        Settings {
          checked_mode: true,
          start_paused: true,
          trace_startup: true,
          extra_flags: Some("--foo --bar".to_string()),
          ..Default::default()
        },
      ),
    ];
    for (precompiled, settings) in combos {
      let args = flag_set(precompiled, &settings);
      assert_eq!(args[0], "--ignore-unrecognized-flags");
    }
  }

  #[test]
  fn profiling_mirrors_and_background_compilation_are_unconditional() {
    let args = flag_set(false, &Settings::default());
    assert!(args.iter().any(|a| a == "--profile_period=1000"));
    assert!(args.iter().any(|a| a == "--enable_mirrors=false"));
    assert!(args.iter().any(|a| a == "--background_compilation"));
  }

  #[test]
  fn precompilation_flag_tracks_execution_mode() {
    let on = flag_set(true, &Settings::default());
    let off = flag_set(false, &Settings::default());
    assert!(on.iter().any(|a| a == "--precompilation"));
    assert!(!off.iter().any(|a| a == "--precompilation"));
  }

  #[cfg(not(feature = "strict"))]
  #[test]
  fn checked_mode_follows_settings_when_not_precompiled() {
    let settings = Settings {
      checked_mode: true,
      ..Default::default()
    };
    let args = flag_set(false, &settings);
    assert!(args.iter().any(|a| a == "--enable_asserts"));
    assert!(args.iter().any(|a| a == "--enable_type_checks"));

    let args = flag_set(false, &Settings::default());
    assert!(!args.iter().any(|a| a == "--enable_asserts"));
  }

  #[test]
  fn checked_mode_never_present_when_precompiled() {
    let settings = Settings {
      checked_mode: true,
      ..Default::default()
    };
    let args = flag_set(true, &settings);
    assert!(!args.iter().any(|a| a == "--enable_asserts"));
    assert!(!should_enable_checked_mode(true, &settings));
  }

  #[test]
  fn start_paused_and_trace_startup_are_conditional() {
    let settings = Settings {
      start_paused: true,
      trace_startup: true,
      ..Default::default()
    };
    let args = flag_set(false, &settings);
    assert!(args.iter().any(|a| a == "--pause_isolates_on_start"));
    assert!(args.iter().any(|a| a.starts_with("--timeline_streams=")));

    let args = flag_set(false, &Settings::default());
    assert!(!args.iter().any(|a| a == "--pause_isolates_on_start"));
    assert!(!args.iter().any(|a| a.starts_with("--timeline_streams=")));
  }

  #[test]
  fn extra_flags_split_on_whitespace_and_go_last() {
    let settings = Settings {
      extra_flags: Some("--foo  --bar=1\t--baz".to_string()),
      ..Default::default()
    };
    let args = flag_set(false, &settings);
    let len = args.len();
    assert_eq!(&args[len - 3..], &["--foo", "--bar=1", "--baz"]);
  }

  #[test]
  fn embedder_defaults_precede_user_flags() {
    let settings = Settings {
      extra_flags: Some("--enable_mirrors=true".to_string()),
      ..Default::default()
    };
    let args = flag_set(false, &settings);
    let default_pos =
      args.iter().position(|a| a == "--enable_mirrors=false").unwrap();
    let user_pos =
      args.iter().position(|a| a == "--enable_mirrors=true").unwrap();
    assert!(default_pos < user_pos);
  }
}
