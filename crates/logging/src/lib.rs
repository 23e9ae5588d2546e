use log::*;
use log4rs::*;
use log4rs::append::file::FileAppender;
use log4rs::encode::pattern::PatternEncoder;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Logger, Root};

const PATTERN: &str = "GR | {d(%Y-%m-%d %H:%M:%S)} | {({l}):5.5} | {f}:{L} | {m}{n}";

#[derive(Debug)]
pub enum LoggingError {
    Appender(std::io::Error),
    Config(log4rs::config::runtime::ConfigErrors),
    AlreadyInitialized(SetLoggerError),
}

/// Sets up console and file output at trace level and routes panics into the log.
pub fn init(file: &str) -> Result<(), LoggingError> {
    init_with_level(file, LevelFilter::Trace)
}

pub fn init_with_level(file: &str, level: LevelFilter) -> Result<(), LoggingError> {
    let config = build_config(file, level)?;

    init_config(config).map_err(LoggingError::AlreadyInitialized)?;
    log_panics::init();

    Ok(())
}

fn build_config(file: &str, level: LevelFilter) -> Result<Config, LoggingError> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    let file = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(file)
        .map_err(LoggingError::Appender)?;

    Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .appender(Appender::builder().build("file", Box::new(file)))
        .logger(Logger::builder().build("grapple", level))
        .build(
            Root::builder()
                .appender("stderr")
                .appender("file")
                .build(level),
        )
        .map_err(LoggingError::Config)
}

#[cfg(test)]
mod tests {
    use log::LevelFilter;

    #[test]
    fn we_can_build_a_config_with_a_file_appender() {
        let path = std::env::temp_dir().join(format!("grapple-logging-{}.log", std::process::id()));
        let config = super::build_config(path.to_str().unwrap(), LevelFilter::Debug).unwrap();

        assert_eq!(config.appenders().len(), 2);
        assert_eq!(config.root().level(), LevelFilter::Debug);

        let _ = std::fs::remove_file(path);
    }
}
