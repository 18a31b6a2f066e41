use anyhow::Result;

fn main() -> Result<()> {
    let code = preinit::cli::run()?;
    std::process::exit(code)
}
