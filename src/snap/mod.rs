pub mod avatar;
pub mod config;
pub mod correlate;
pub mod days;
pub mod extract;
pub mod lock;
pub mod media;
pub mod output;
pub mod paths;
pub mod progress;
pub mod records;
pub mod timestamp;
pub mod util;
pub mod warn;
