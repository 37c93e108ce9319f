//! `rootpull version` command.

pub fn execute() -> Result<(), Box<dyn std::error::Error>> {
    println!("rootpull {}", rootpull_core::VERSION);
    Ok(())
}
