pub mod campaign;
pub mod configuration;
pub mod domain;
pub mod normalize;
pub mod quota;
pub mod render;
pub mod selector;
pub mod startup;
pub mod telemetry;
pub mod transport;

use std::error::Error;

pub fn error_chain_fmt(e: &impl Error, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    writeln!(f, "{e}\n")?;
    let mut current = e.source();

    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{cause}")?;
        current = cause.source();
    }

    Ok(())
}
