//! Embeds the agent payloads.
//!
//! `PREINIT_AGENT_BIN` names the agent binary to embed; it is xz-compressed
//! into `OUT_DIR/agent.xz`. `PREINIT_RC` names the service script, copied to
//! `OUT_DIR/agent.rc` (default `assets/init.magisk.rc`).

use std::{env, fs, io, io::Read, path::PathBuf};

use xz2::read::XzEncoder;

const DEFAULT_RC: &str = "assets/init.magisk.rc";

fn main() -> Result<(), io::Error> {
    println!("cargo:rerun-if-env-changed=PREINIT_AGENT_BIN");
    println!("cargo:rerun-if-env-changed=PREINIT_RC");

    let out_dir = PathBuf::from(env::var("OUT_DIR").map_err(io::Error::other)?);

    let agent = match env::var("PREINIT_AGENT_BIN") {
        Ok(path) => {
            println!("cargo:rerun-if-changed={}", path);
            fs::read(&path)?
        }
        Err(_) => {
            println!("cargo:warning=PREINIT_AGENT_BIN unset; embedding an empty agent");
            Vec::new()
        }
    };

    let mut compressed = Vec::new();
    XzEncoder::new(agent.as_slice(), 9).read_to_end(&mut compressed)?;
    fs::write(out_dir.join("agent.xz"), compressed)?;

    let rc = env::var("PREINIT_RC").unwrap_or_else(|_| DEFAULT_RC.to_string());
    println!("cargo:rerun-if-changed={}", rc);
    fs::copy(&rc, out_dir.join("agent.rc"))?;

    Ok(())
}
