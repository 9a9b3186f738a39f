use std::error::Error;
use std::fs;

use camino::Utf8PathBuf;
use clap::Parser;
use log::{error, info};

use mcalfit::batch::{run_meds_file, time_seed, RunConfig};
use mcalfit::constants::DEFAULT_CHUNK_SIZE;
use mcalfit::logging::setup_logger;
use mcalfit::selector::ObsSelection;

/// Metacalibration shape fitting of the objects of a MEDS file.
#[derive(Debug, Parser)]
#[command(author, version, about = "Metacalibration fits on MEDS cutouts")]
struct Args {
    /// MEDS file to fit.
    medsfile: Utf8PathBuf,

    /// Output Parquet file name, relative to the output directory.
    outfile: Utf8PathBuf,

    /// Output directory; also holds the log file and the diagnostic plots.
    #[arg(long, default_value = ".")]
    outdir: Utf8PathBuf,

    /// First catalogue row to fit.
    #[arg(long)]
    start: Option<usize>,

    /// One past the last catalogue row to fit.
    #[arg(long)]
    end: Option<usize>,

    /// Number of worker threads.
    #[arg(short = 'n', long = "nproc", default_value_t = 1)]
    nproc: usize,

    /// Objects read from the MEDS file per round of fitting.
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Run seed; the current Unix time when omitted.
    #[arg(long)]
    seed: Option<u64>,

    /// Write a diagnostic PNG per fitted object.
    #[arg(long = "plot")]
    make_plots: bool,

    /// Fit the coadd together with the single-epoch cutouts.
    #[arg(long)]
    use_coadd: bool,

    /// Fit the coadd only (wins over --use-coadd).
    #[arg(long)]
    use_coadd_only: bool,

    /// Replace an existing output file.
    #[arg(long)]
    overwrite: bool,

    /// Verbose logging.
    #[arg(long = "vb")]
    verbose: bool,
}

impl Args {
    fn to_config(&self) -> Result<RunConfig, Box<dyn Error>> {
        Ok(RunConfig::builder(&self.medsfile, &self.outfile)
            .outdir(&self.outdir)
            .start(self.start)
            .end(self.end)
            .nproc(self.nproc)
            .chunk_size(self.chunk_size)
            .seed(self.seed.unwrap_or_else(time_seed))
            .make_plots(self.make_plots)
            .selection(ObsSelection::from_flags(self.use_coadd, self.use_coadd_only))
            .overwrite(self.overwrite)
            .verbose(self.verbose)
            .build()?)
    }
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let config = args.to_config()?;

    fs::create_dir_all(&config.outdir)?;
    if config.make_plots {
        fs::create_dir_all(config.plot_dir())?;
    }
    let _logger = setup_logger(&config.outdir, config.verbose)?;

    match run_meds_file(&config) {
        Ok(out) => {
            info!(
                "{} of {} objects written to {}",
                out.table.num_rows(),
                out.outcomes.len(),
                config.output_path()
            );
            Ok(())
        }
        Err(e) => {
            error!("Run aborted: {e}");
            Err(e.into())
        }
    }
}
