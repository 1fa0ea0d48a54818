use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// ONNX segmentation model, loaded once at startup
    #[arg(
        short,
        long,
        global = true,
        env = "NEUROSEG_MODEL",
        default_value = "best_model.onnx"
    )]
    pub model_path: PathBuf,

    #[arg(short, long, global = true, default_value_t = 0)]
    pub device_id: i32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Serve the upload API over HTTP
    Serve(ServeArgs),
    /// Analyze a single image and write the results next to each other
    Analyze(AnalyzeArgs),
    /// Analyze every image below a directory
    Batch(BatchArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    #[arg(long, env = "HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    #[arg(short, long, env = "PORT", default_value_t = 7860)]
    pub port: u16,

    /// Report file shared by every request
    #[arg(long, env = "NEUROSEG_REPORT", default_value = "report.txt")]
    pub report_path: PathBuf,
}

impl ServeArgs {
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[derive(Args, Clone, Debug)]
pub struct AnalyzeArgs {
    pub image: PathBuf,

    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Defaults to `report.txt` inside the output directory
    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

impl AnalyzeArgs {
    pub fn report_path(&self) -> PathBuf {
        self.report_path
            .clone()
            .unwrap_or_else(|| self.output_dir.join("report.txt"))
    }
}

#[derive(Args, Clone, Debug)]
pub struct BatchArgs {
    pub input_dir: PathBuf,

    #[arg(default_value = "output")]
    pub output_dir: PathBuf,

    #[arg(short = 'j', long, default_value_t = default_threads())]
    pub num_threads: usize,
}

fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}
