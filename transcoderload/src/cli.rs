use clap::Parser;

/// Empirically determines how many concurrent transcoder processes a host
/// can sustain by ramping up parallelism until stalls are detected.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Transcoder binary to launch per job.
    #[arg(long, default_value = "ffmpeg")]
    pub cmd: String,

    /// Raise log verbosity to debug.
    #[arg(short, long)]
    pub verbose: bool,

    /// Arguments forwarded verbatim to every launched transcoder process.
    #[arg(last = true)]
    pub forwarded: Vec<String>,
}
