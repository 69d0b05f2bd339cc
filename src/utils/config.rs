//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(ShardsetError)` on parser failure.
///
/// Example:
/// ```no_run
/// # use shardset::parsed_config;
/// # #[derive(Default)]
/// # struct MyConfig { batch_size: u32, file_path: String }
/// # fn example(config_str: Option<&str>) -> Result<(), shardset::ShardsetError> {
/// let config = parsed_config!(config_str => MyConfig; batch_size, file_path)?;
/// # let _ = config;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::ShardsetError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if !table.is_empty() {
                return Err($crate::ShardsetError(format!(
                    "invalid field name '{}' in config",
                    table.keys().next().unwrap(),
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::ShardsetError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        abc: u16,
        hij: String,
        lmn: f64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                abc: 7,
                hij: "shard".into(),
                lmn: 6.18,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), ShardsetError> {
        let config = parsed_config!(None => TestConfig; abc, hij, lmn)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), ShardsetError> {
        let config_str = Some("hij = 'Nice'");
        let config = parsed_config!(config_str => TestConfig; hij, lmn)?;
        let ref_config = TestConfig {
            abc: 7,
            hij: "Nice".into(),
            lmn: 6.18,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("xyz = 999");
        assert!(parsed_config!(config_str => TestConfig; abc).is_err());
    }
}
