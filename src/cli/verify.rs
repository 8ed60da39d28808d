use crate::archive::{verify_or_fail, ArchiveMetadata};
use crate::cli::VerifyArgs;

pub fn execute(args: VerifyArgs) -> anyhow::Result<()> {
    let metadata = ArchiveMetadata::load(&args.run_dir)?;
    let archive = metadata.archive_path(&args.run_dir);

    verify_or_fail(&archive, &metadata.sha256)?;

    println!(
        "OK {} {} ({} bytes, sha256 {})",
        metadata.framework, metadata.run_id, metadata.size_bytes, metadata.sha256
    );
    Ok(())
}
