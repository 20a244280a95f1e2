//! Persistent host identity: base64 secret key files.

use std::path::Path;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use iroh::{EndpointId, SecretKey};

/// Load a secret key from a file holding its base64 encoding.
pub fn load_secret(path: &Path) -> Result<SecretKey> {
    if !path.exists() {
        anyhow::bail!(
            "Secret key file not found: {}\nGenerate one with: tunnel-http generate-secret --output {}",
            path.display(),
            path.display()
        );
    }

    let content = std::fs::read_to_string(path).context("Failed to read secret key file")?;
    load_secret_from_string(content.trim())
}

pub fn load_secret_from_string(base64_key: &str) -> Result<SecretKey> {
    let bytes = BASE64
        .decode(base64_key)
        .context("Invalid base64 in secret key")?;
    SecretKey::try_from(&bytes[..]).context("Invalid secret key (must be 32 bytes)")
}

pub fn encode_secret(secret: &SecretKey) -> String {
    BASE64.encode(secret.to_bytes())
}

pub fn endpoint_id(secret: &SecretKey) -> EndpointId {
    secret.public()
}

/// Write `secret_content` to `output` (mode 0600), or to stdout when `output`
/// is `-`. Refuses to overwrite unless `force`.
fn write_secret(output: &Path, secret_content: &str, public_info: &str, force: bool) -> Result<()> {
    if output.to_str() == Some("-") {
        println!("{}", secret_content);
        eprintln!("{}", public_info);
        return Ok(());
    }

    if output.exists() && !force {
        anyhow::bail!(
            "File already exists: {}. Use --force to overwrite.",
            output.display()
        );
    }

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).context("Failed to create parent directory")?;
    }
    std::fs::write(output, secret_content).context("Failed to write secret key file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(output)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(output, perms)?;
    }

    log::info!("Secret key saved to: {}", output.display());
    println!("{}", public_info);
    Ok(())
}

/// Generate a new secret key file and print its EndpointId.
pub fn generate_secret(output: &Path, force: bool) -> Result<SecretKey> {
    let secret = SecretKey::generate(&mut rand::rng());
    write_secret(
        output,
        &encode_secret(&secret),
        &format!("EndpointId: {}", endpoint_id(&secret)),
        force,
    )?;
    Ok(secret)
}

pub fn show_id(secret_file: &Path) -> Result<()> {
    let secret = load_secret(secret_file)?;
    println!("{}", endpoint_id(&secret));
    Ok(())
}
