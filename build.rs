use anyhow::Result;
use vergen::{vergen, Config};

fn main() -> Result<()> {
    // trigger recompilation when a new migration is added
    println!("cargo:rerun-if-changed=migrations-sqlx");

    // Builds from a source tarball have no git metadata, which only means the
    // Sentry release falls back to the crate version.
    if let Err(error) = vergen(Config::default()) {
        println!("cargo:warning=Skipping git build metadata: {}", error);
    }

    Ok(())
}
