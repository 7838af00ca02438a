use anyhow::{Context, Result, bail};
use std::path::Path;
use tether_client::ClientConfig;
use tether_crypto::MasterSecret;
use tether_crypto::recovery;

/// Read instead of prompting when set; meant for scripts.
pub const PASSPHRASE_ENV: &str = "TETHER_PASSPHRASE";

const MIN_PASSPHRASE_LEN: usize = 8;

/// Create or restore the account secret and store it under a passphrase.
pub fn cmd_login(config: &ClientConfig, restore: bool, force: bool) -> Result<()> {
    let path = config.secret_path();
    if recovery::has_stored_secret(&path) && !force {
        eprintln!();
        eprintln!("  \x1b[1;32mAlready logged in.\x1b[0m Secret: {}", path.display());
        eprintln!("  Use `tether login --force` to replace it.");
        eprintln!();
        return Ok(());
    }

    let secret = if restore {
        let phrase = rpassword::prompt_password("  Backup phrase: ")
            .context("failed to read backup phrase")?;
        recovery::mnemonic_to_secret(&phrase).context("invalid backup phrase")?
    } else {
        MasterSecret::generate()
    };

    eprintln!();
    eprintln!("  Choose a passphrase to protect your secret on this machine.");
    eprintln!();
    let passphrase = prompt_new_passphrase()?;
    recovery::save_encrypted_secret(&path, &passphrase, &secret)
        .context("failed to store secret")?;
    tracing::info!(path = %path.display(), restored = restore, "secret stored");

    if !restore {
        display_mnemonic(&secret, "Your backup phrase")?;
        eprintln!("  You need it to sign in on another device.");
        eprintln!();
    }
    eprintln!("  \x1b[1;32mLogged in.\x1b[0m Secret: {}", path.display());
    Ok(())
}

/// Print the backup phrase for the stored secret.
pub fn cmd_backup(config: &ClientConfig) -> Result<()> {
    let secret = unlock(&config.secret_path())?;
    display_mnemonic(&secret, "Your backup phrase")
}

/// Decrypt the stored secret, prompting for the passphrase unless it is in
/// the environment.
pub fn unlock(path: &Path) -> Result<MasterSecret> {
    if !recovery::has_stored_secret(path) {
        bail!("not logged in (no secret at {}); run `tether login`", path.display());
    }
    let passphrase = match std::env::var(PASSPHRASE_ENV) {
        Ok(p) if !p.is_empty() => p,
        _ => rpassword::prompt_password("Passphrase: ").context("failed to read passphrase")?,
    };
    recovery::load_encrypted_secret(path, &passphrase)
}

fn prompt_new_passphrase() -> Result<String> {
    loop {
        let pass1 = rpassword::prompt_password("  Enter passphrase: ")
            .context("failed to read passphrase")?;
        if pass1.len() < MIN_PASSPHRASE_LEN {
            eprintln!(
                "  \x1b[1;31mPassphrase must be at least {MIN_PASSPHRASE_LEN} characters.\x1b[0m"
            );
            continue;
        }
        let pass2 = rpassword::prompt_password("  Confirm passphrase: ")
            .context("failed to read passphrase")?;
        if pass1 != pass2 {
            eprintln!("  \x1b[1;31mPassphrases do not match. Try again.\x1b[0m");
            continue;
        }
        return Ok(pass1);
    }
}

fn display_mnemonic(secret: &MasterSecret, label: &str) -> Result<()> {
    let mnemonic = recovery::secret_to_mnemonic(secret)?;
    eprintln!();
    eprintln!("  {label} (24 words):");
    eprintln!();
    for line in mnemonic_lines(&mnemonic) {
        eprintln!("    {line}");
    }
    eprintln!();
    eprintln!("  \x1b[1;31mAnyone with these words can read every session.\x1b[0m");
    eprintln!();
    Ok(())
}

/// Four numbered words per line.
fn mnemonic_lines(mnemonic: &str) -> Vec<String> {
    let words: Vec<&str> = mnemonic.split_whitespace().collect();
    words
        .chunks(4)
        .enumerate()
        .map(|(i, chunk)| {
            chunk
                .iter()
                .enumerate()
                .map(|(j, w)| format!("{:>2}. {:<12}", i * 4 + j + 1, w))
                .collect::<Vec<_>>()
                .join("  ")
                .trim_end()
                .to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonic_is_numbered_in_rows_of_four() {
        let secret = MasterSecret::generate();
        let mnemonic = recovery::secret_to_mnemonic(&secret).unwrap();
        let lines = mnemonic_lines(&mnemonic);
        assert_eq!(lines.len(), 6);
        assert!(lines[0].starts_with(" 1. "));
        assert!(lines[5].contains("24. "));
    }

    #[test]
    fn unlock_without_secret_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = unlock(&dir.path().join("secret.json")).unwrap_err();
        assert!(err.to_string().contains("not logged in"));
    }
}
