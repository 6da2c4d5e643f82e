//! Tests for configuration loading

use childmux::config::{Config, EngineConfig};
use std::fs;
use tempfile::TempDir;

#[cfg(test)]
mod defaults_tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let engine = EngineConfig::default();
        assert_eq!(engine.read_block_size, 4096);
        assert_eq!(engine.shell, "/bin/sh");
        assert!(engine.library_path_var.ends_with("LIBRARY_PATH"));
        assert!(engine.default_path.contains("/bin"));
    }

    #[test]
    fn test_log_filter_defaults_to_warn() {
        assert_eq!(Config::default().log.filter, "warn");
    }

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.engine.read_block_size, 4096);
        assert_eq!(config.log.filter, "warn");
    }
}

#[cfg(test)]
mod parse_tests {
    use super::*;

    #[test]
    fn test_partial_engine_section_keeps_other_defaults() {
        let config = Config::from_toml_str(
            r#"
[engine]
read_block_size = 512
shell = "/bin/bash"
"#,
        )
        .unwrap();

        assert_eq!(config.engine.read_block_size, 512);
        assert_eq!(config.engine.shell, "/bin/bash");
        assert_eq!(
            config.engine.default_path,
            EngineConfig::default().default_path
        );
    }

    #[test]
    fn test_zero_block_size_falls_back_to_default() {
        let config = Config::from_toml_str("[engine]\nread_block_size = 0\n").unwrap();
        assert_eq!(config.engine.read_block_size, 4096);
    }

    #[test]
    fn test_log_section() {
        let config = Config::from_toml_str("[log]\nfilter = \"childmux=debug\"\n").unwrap();
        assert_eq!(config.log.filter, "childmux=debug");
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(Config::from_toml_str("[engine\nshell = ").is_err());
        assert!(Config::from_toml_str("[engine]\nread_block_size = \"big\"\n").is_err());
    }
}

#[cfg(test)]
mod file_tests {
    use super::*;

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[engine]\nlibrary_path_var = \"MY_LIBS\"\n").unwrap();

        let config = Config::load_from(&path).expect("config should load");
        assert_eq!(config.engine.library_path_var, "MY_LIBS");
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load_from(&dir.path().join("absent.toml")).is_none());
    }

    #[test]
    fn test_load_from_unparsable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "not = [valid").unwrap();
        assert!(Config::load_from(&path).is_none());
    }
}
