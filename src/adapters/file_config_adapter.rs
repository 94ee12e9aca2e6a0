//! INI file configuration adapter.

use crate::domain::error::SigtraderError;
use crate::ports::config_port::ConfigPort;
use configparser::ini::Ini;
use std::path::Path;

pub struct FileConfigAdapter {
    config: Ini,
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SigtraderError> {
        let path = path.as_ref();
        let mut config = Ini::new();
        config
            .load(path)
            .map_err(|reason| SigtraderError::ConfigParse {
                file: path.display().to_string(),
                reason,
            })?;
        Ok(Self { config })
    }

    pub fn from_string(content: &str) -> Result<Self, SigtraderError> {
        let mut config = Ini::new();
        config
            .read(content.to_string())
            .map_err(|reason| SigtraderError::ConfigParse {
                file: "<string>".to_string(),
                reason,
            })?;
        Ok(Self { config })
    }

    fn parse_bool(value: &str) -> Option<bool> {
        match value.to_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        }
    }
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.config.get(section, key)
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        self.config
            .getint(section, key)
            .ok()
            .flatten()
            .unwrap_or(default)
    }

    fn get_double(&self, section: &str, key: &str, default: f64) -> f64 {
        self.config
            .getfloat(section, key)
            .ok()
            .flatten()
            .unwrap_or(default)
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        self.config
            .get(section, key)
            .as_ref()
            .and_then(|v| Self::parse_bool(v))
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn from_string_parses_config() {
        let content = r#"
[sqlite]
path = /var/lib/sigtrader/trader.db

[account]
initial_capital = 100000.0

[pipeline]
timeframe = 1h
lookback = 120
"#;
        let adapter = FileConfigAdapter::from_string(content).unwrap();
        assert_eq!(
            adapter.get_string("sqlite", "path"),
            Some("/var/lib/sigtrader/trader.db".to_string())
        );
        assert_eq!(adapter.get_string("pipeline", "timeframe"), Some("1h".to_string()));
        assert_eq!(adapter.get_int("pipeline", "lookback", 0), 120);
    }

    #[test]
    fn get_string_returns_none_for_missing_key() {
        let adapter =
            FileConfigAdapter::from_string("[account]\ninitial_capital = 100\n").unwrap();
        assert_eq!(adapter.get_string("account", "missing"), None);
        assert_eq!(adapter.get_string("missing_section", "key"), None);
    }

    #[test]
    fn get_int_returns_default_for_missing_or_non_numeric() {
        let adapter = FileConfigAdapter::from_string("[gate]\nmax_open_positions = abc\n").unwrap();
        assert_eq!(adapter.get_int("gate", "max_open_positions", 42), 42);
        assert_eq!(adapter.get_int("gate", "missing", 7), 7);
    }

    #[test]
    fn get_double_returns_value() {
        let adapter = FileConfigAdapter::from_string("[risk]\nrisk_fraction = 0.015\n").unwrap();
        assert_eq!(adapter.get_double("risk", "risk_fraction", 0.0), 0.015);
        assert_eq!(adapter.get_double("risk", "missing", 99.9), 99.9);
    }

    #[test]
    fn get_bool_accepts_common_spellings() {
        let adapter = FileConfigAdapter::from_string(
            "[gate]\na = true\nb = yes\nc = 1\nd = false\ne = no\nf = 0\n",
        )
        .unwrap();
        assert!(adapter.get_bool("gate", "a", false));
        assert!(adapter.get_bool("gate", "b", false));
        assert!(adapter.get_bool("gate", "c", false));
        assert!(!adapter.get_bool("gate", "d", true));
        assert!(!adapter.get_bool("gate", "e", true));
        assert!(!adapter.get_bool("gate", "f", true));
        assert!(adapter.get_bool("gate", "missing", true));
    }

    #[test]
    fn get_list_splits_and_trims() {
        let adapter =
            FileConfigAdapter::from_string("[pipeline]\nsymbols = BTCUSD, ETHUSD ,,SOLUSD\n")
                .unwrap();
        assert_eq!(
            adapter.get_list("pipeline", "symbols"),
            vec!["BTCUSD", "ETHUSD", "SOLUSD"]
        );
        assert!(adapter.get_list("pipeline", "missing").is_empty());
    }

    #[test]
    fn from_file_reads_config() {
        let file = create_temp_config("[broker]\ntimeout_ms = 2500\n");
        let adapter = FileConfigAdapter::from_file(file.path()).unwrap();
        assert_eq!(adapter.get_int("broker", "timeout_ms", 0), 2500);
    }

    #[test]
    fn from_file_returns_error_for_missing_file() {
        let result = FileConfigAdapter::from_file("/nonexistent/path/config.ini");
        assert!(matches!(result, Err(SigtraderError::ConfigParse { .. })));
    }
}
