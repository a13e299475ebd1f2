//! Selection and configuration of the target JS shell.
//!
//! Which engine to drive is decided entirely by environment variables, read
//! once into a [`TargetConfig`]; the rest of the crate never consults the
//! environment. The argv templates only prime each shell for deterministic,
//! coverage-friendly execution: the real contract is that the binary speaks
//! REPRL and carries sanitizer-style edge instrumentation.

use std::{ffi::OsString, path::PathBuf, str::FromStr};

use derive_new::new as New;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingVar(&'static str),
    #[error("unknown target engine {0:?}; expected one of v8, firefox, jsc")]
    UnknownEngine(String),
}

/// The supported JS engine families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsEngine {
    V8,
    Firefox,
    Jsc,
}

impl FromStr for JsEngine {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "v8" => Ok(Self::V8),
            "firefox" => Ok(Self::Firefox),
            "jsc" => Ok(Self::Jsc),
            other => Err(ConfigError::UnknownEngine(other.to_owned())),
        }
    }
}

/// Everything needed to spawn and supervise one kind of target shell.
#[derive(Debug, Clone, New)]
pub struct TargetConfig {
    pub engine: JsEngine,
    /// Absolute path of the instrumented shell binary.
    pub bin: PathBuf,
    /// Firefox only: use the baseline wasm compiler instead of ion.
    #[new(default)]
    pub baseline: bool,
    /// Leave child stdout/stderr attached to the parent's for debugging.
    #[new(default)]
    pub debug_output: bool,
    #[new(value = "true")]
    pub capture_stdout: bool,
    #[new(value = "true")]
    pub capture_stderr: bool,
    /// Maintain per-edge hit counters in addition to the virgin bitmap.
    #[new(default)]
    pub track_edges: bool,
}

impl TargetConfig {
    /// Reads the configuration from `TARGET`, `BIN`, `BASELINE` and
    /// `DOUTPUT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let engine: JsEngine = std::env::var("TARGET")
            .map_err(|_| ConfigError::MissingVar("TARGET"))?
            .parse()?;
        let bin = std::env::var_os("BIN")
            .map(PathBuf::from)
            .ok_or(ConfigError::MissingVar("BIN"))?;

        let mut config = Self::new(engine, bin);
        config.baseline = std::env::var_os("BASELINE").is_some();
        config.debug_output = std::env::var_os("DOUTPUT").is_some();
        Ok(config)
    }

    /// Argument vector for the child, starting with the binary itself.
    pub fn argv(&self) -> Vec<OsString> {
        let mut argv = vec![self.bin.clone().into_os_string()];
        match self.engine {
            JsEngine::V8 => {
                argv.extend(["--expose-gc", "--fuzzing", "--allow-natives-syntax"].map(Into::into));
            }
            JsEngine::Firefox => {
                argv.extend(["--fuzzing-safe", "--reprl"].map(Into::into));
                argv.push(
                    if self.baseline {
                        "--wasm-compiler=baseline"
                    } else {
                        "--wasm-compiler=ion"
                    }
                    .into(),
                );
            }
            JsEngine::Jsc => argv.push("--reprl".into()),
        }
        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_names_parse() {
        assert_eq!("v8".parse::<JsEngine>().unwrap(), JsEngine::V8);
        assert_eq!("firefox".parse::<JsEngine>().unwrap(), JsEngine::Firefox);
        assert_eq!("jsc".parse::<JsEngine>().unwrap(), JsEngine::Jsc);
        assert!(matches!(
            "spidermonkey".parse::<JsEngine>(),
            Err(ConfigError::UnknownEngine(_))
        ));
    }

    #[test]
    fn argv_starts_with_the_binary() {
        let config = TargetConfig::new(JsEngine::Jsc, PathBuf::from("/opt/jsc"));
        let argv = config.argv();
        assert_eq!(argv[0], "/opt/jsc");
        assert_eq!(argv[1], "--reprl");
    }

    #[test]
    fn baseline_switches_the_wasm_compiler() {
        let mut config = TargetConfig::new(JsEngine::Firefox, PathBuf::from("/opt/js"));
        assert!(config.argv().contains(&"--wasm-compiler=ion".into()));
        config.baseline = true;
        let argv = config.argv();
        assert!(argv.contains(&"--wasm-compiler=baseline".into()));
        assert!(!argv.contains(&"--wasm-compiler=ion".into()));
    }

    #[test]
    fn capture_defaults_are_on() {
        let config = TargetConfig::new(JsEngine::V8, PathBuf::from("/opt/d8"));
        assert!(config.capture_stdout && config.capture_stderr);
        assert!(!config.track_edges && !config.debug_output);
    }
}
