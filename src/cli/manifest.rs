use crate::cli::{load_config, ManifestCommand};
use crate::manifest::Manifest;

pub fn execute(command: ManifestCommand) -> anyhow::Result<()> {
    match command {
        ManifestCommand::Rebuild(args) => {
            let (config, base_dir) = load_config(&args, None)?;
            let runs_dir = base_dir.join(&config.runs_dir);

            let mut manifest = Manifest::rebuild(&runs_dir);
            manifest.save(&runs_dir)?;

            println!(
                "Rebuilt {} with {} run(s)",
                Manifest::path(&runs_dir).display(),
                manifest.total_runs
            );
            for (framework, count) in &manifest.frameworks {
                println!("  {}: {}", framework, count);
            }
        }
    }
    Ok(())
}
