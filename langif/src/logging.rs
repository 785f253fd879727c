use std::fmt;

/// Box log severity. Levels are spaced by 10 so collaborators can slot
/// their own in between.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogLevel(pub u8);

impl LogLevel {
    pub const NOTSET: Self = Self(0);
    /// printf style debugging
    pub const DEBUG: Self = Self(10);
    /// what is being communicated, identifiers
    pub const INFO: Self = Self(20);
    /// unexpected, the computation can resume
    pub const WARN: Self = Self(30);
    /// unexpected, the current computation is aborted
    pub const ERROR: Self = Self(40);
    /// unexpected, behavior beyond this point is undefined
    pub const FATAL: Self = Self(50);

    pub fn aborts(self) -> bool {
        self >= Self::ERROR
    }

    pub fn to_log_level(self) -> log::Level {
        match self.0 {
            0..10 => log::Level::Trace,
            10..20 => log::Level::Debug,
            20..30 => log::Level::Info,
            30..40 => log::Level::Warn,
            _ => log::Level::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NOTSET => f.write_str("NOTSET"),
            Self::DEBUG => f.write_str("DEBUG"),
            Self::INFO => f.write_str("INFO"),
            Self::WARN => f.write_str("WARN"),
            Self::ERROR => f.write_str("ERROR"),
            Self::FATAL => f.write_str("FATAL"),
            Self(other) => write!(f, "LEVEL{other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_keep_their_numeric_spacing() {
        let levels = [
            LogLevel::NOTSET,
            LogLevel::DEBUG,
            LogLevel::INFO,
            LogLevel::WARN,
            LogLevel::ERROR,
            LogLevel::FATAL,
        ];
        for (i, level) in levels.iter().enumerate() {
            assert_eq!(level.0 as usize, i * 10);
        }
    }

    #[test]
    fn custom_levels_fall_into_their_band() {
        assert_eq!(LogLevel(25).to_log_level(), log::Level::Info);
        assert_eq!(LogLevel(35).to_log_level(), log::Level::Warn);
        assert_eq!(LogLevel::FATAL.to_log_level(), log::Level::Error);
        assert_eq!(LogLevel::NOTSET.to_log_level(), log::Level::Trace);
        assert_eq!(LogLevel(25).to_string(), "LEVEL25");
        assert_eq!(LogLevel::WARN.to_string(), "WARN");
    }

    #[test]
    fn only_error_and_above_abort() {
        assert!(!LogLevel::WARN.aborts());
        assert!(!LogLevel(39).aborts());
        assert!(LogLevel::ERROR.aborts());
        assert!(LogLevel::FATAL.aborts());
    }
}
