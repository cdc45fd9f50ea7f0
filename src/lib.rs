use std::env;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod audio;
pub mod checkpoint;
pub mod f0;
pub mod hparams;
pub mod inference;
pub mod preprocessing;
pub mod training;

pub use hparams::HParams;
pub use inference::{Speaker, Svc};

pub fn setup_logging() {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("xd_svc=info,svc=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Logging was already initialised: {}", e);
    }
}
