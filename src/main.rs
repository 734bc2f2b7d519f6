fn main() {
    #[cfg(feature = "cli")]
    packbench::cli::run();

    #[cfg(not(feature = "cli"))]
    {
        eprintln!("packbench: CLI not enabled. Rebuild with `--features cli`.");
        std::process::exit(1);
    }
}
