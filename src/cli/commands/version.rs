//! Version command - show version information

/// Print version information
///
/// If verbose is false, prints a single line with name and version.
/// If verbose is true, prints build information as well.
pub fn print_version(verbose: bool) {
    println!("{} {}", crate::NAME, crate::VERSION);

    if verbose {
        println!();
        println!("Features:");
        println!("  - SSH proxy resolving <code>_<user> logins through a directory");
        println!("  - Shell transcripts and SFTP/SCP transfer events");
        println!("  - Control-plane IPC with remote session close");
        println!("  - JSONL audit log");
        println!();
        println!("Build info:");
        println!("  Target:    {}", env!("BUILD_TARGET"));
        println!("  Profile:   {}", env!("BUILD_PROFILE"));
        println!("  Rust:      {}", env!("RUSTC_VERSION"));
        if let Ok(exe) = std::env::current_exe() {
            println!("  Executable: {}", exe.display());
        }
    }
}

/// Execute the version command
pub async fn execute(verbose: bool) -> anyhow::Result<()> {
    print_version(verbose);
    Ok(())
}
