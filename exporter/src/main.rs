use std::env;

use exporter::ExportConfig;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = ExportConfig::from_args(env::args().skip(1))?;
    let outcome = exporter::export(&config)?;

    println!("{}", outcome.summary);

    if let Some(report) = outcome.report {
        println!("{report}");
        report.ensure_passed()?;
    }

    Ok(())
}
