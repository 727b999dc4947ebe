use super::Settings;
use tracing::debug;

pub const ENV_JOURNAL_DSN: &str = "DRIFTLINE_JOURNAL_DSN";
pub const ENV_SINK_URL: &str = "DRIFTLINE_SINK_URL";
pub const ENV_SINK_USER: &str = "DRIFTLINE_SINK_USER";
pub const ENV_SINK_PASSWORD: &str = "DRIFTLINE_SINK_PASSWORD";
pub const ENV_PROCESS: &str = "DRIFTLINE_PROCESS";

impl Settings {
    /// Overlays recognised `DRIFTLINE_*` variables. Empty values are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let value: String = value.into();
            if value.is_empty() {
                continue;
            }
            let key = key.as_ref();
            match key {
                ENV_JOURNAL_DSN => self.journal.dsn = value,
                ENV_SINK_URL => self.sink.url = value,
                ENV_SINK_USER => self.sink.user = Some(value),
                ENV_SINK_PASSWORD => self.sink.password = Some(value),
                ENV_PROCESS => self.process = value,
                _ => continue,
            }
            debug!(variable = key, "Applied environment override");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::settings::tests::minimal;

    use super::*;

    #[test]
    fn overrides_replace_file_values() {
        let mut settings = minimal();
        settings.apply_overrides([
            (ENV_JOURNAL_DSN, "postgres://other/journal"),
            (ENV_SINK_PASSWORD, "s3cret"),
            (ENV_PROCESS, "orders-eu"),
            ("HOME", "/root"),
        ]);
        assert_eq!(settings.journal.dsn, "postgres://other/journal");
        assert_eq!(settings.sink.password.as_deref(), Some("s3cret"));
        assert_eq!(settings.process, "orders-eu");
    }

    #[test]
    fn empty_values_do_not_clear_settings() {
        let mut settings = minimal();
        settings.apply_overrides([(ENV_SINK_URL, "")]);
        assert_eq!(settings.sink.url, "http://localhost:8123");
    }
}
