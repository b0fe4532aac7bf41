use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

#[cfg(feature = "debug")]
const LEVEL: LevelFilter = LevelFilter::Debug;
#[cfg(not(feature = "debug"))]
const LEVEL: LevelFilter = LevelFilter::Info;

/// Log to stderr so the throughput samples on stdout stay parseable.
pub fn init_log() {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)}|{l}|{m}{n}",
        )))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(LEVEL))
        .unwrap();

    // a second init in tests is fine, keep the first configuration
    let _ = log4rs::init_config(config);
}
