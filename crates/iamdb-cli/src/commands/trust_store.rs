use std::path::{Path, PathBuf};

use iamdb_pool::{CertificateLoader, CertificateSource};

pub fn trust_store(out_dir: &Path, ca_file: Option<PathBuf>, password: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(out_dir)?;
    let loader = match ca_file {
        Some(path) => CertificateLoader::from_file(path),
        None => CertificateLoader::embedded(),
    }
    .with_store_dir(out_dir);

    let cert = loader.load_root_certificate()?;
    let anchor = loader.build_trust_store(&cert, password)?;
    let alias = anchor.alias().to_string();
    let path = anchor.keep()?;

    println!("✓ Trust store written");
    println!("  Path:  {}", path.display());
    println!("  Alias: {alias}");
    Ok(())
}
