//! Configuration struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// the listed fields by parsing the given TOML string if it's not `None`.
/// Returns `Ok(config)` on success, and `Err(ParasyncError)` on parser
/// failure or on any key that is not among the listed fields.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => EngineConfig;
///                             num_server_threads, checkpoint)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::ParasyncError> {
            let mut config: $config_type = Default::default();
            let mut table = match config_str {
                None => return Ok(config),
                Some(s) => s.parse::<toml::Table>()?,
            };

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // anything left in the table was not expected
            if let Some(key) = table.keys().next() {
                return Err($crate::ParasyncError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::ParasyncError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        threads: u16,
        name: String,
        ratio: f64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                threads: 7,
                name: "sgd".into(),
                ratio: 0.75,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), ParasyncError> {
        let config = parsed_config!(None => TestConfig; threads, name, ratio)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), ParasyncError> {
        let config_str = Some("name = 'lasso'\nratio = 0.5");
        let config = parsed_config!(config_str => TestConfig; name, ratio)?;
        let ref_config = TestConfig {
            threads: 7,
            name: "lasso".into(),
            ratio: 0.5,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("xyz = 999");
        assert!(parsed_config!(config_str => TestConfig; threads).is_err());
    }

    #[test]
    fn parse_wrong_type() {
        let config_str = Some("threads = 'many'");
        assert!(parsed_config!(config_str => TestConfig; threads).is_err());
    }
}
