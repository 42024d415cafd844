use anyhow::{bail, Result};

use hbt_audit::{verify_hash_chain, VerifyResult};

/// Print the verification result; a broken chain is a non-zero exit.
pub fn verify(path: &str) -> Result<()> {
    match verify_hash_chain(path)? {
        VerifyResult::Valid { lines } => {
            println!("audit_chain=valid lines={lines} path={path}");
            Ok(())
        }
        VerifyResult::Broken { line, reason } => {
            println!("audit_chain=broken line={line} path={path}");
            bail!("AUDIT_CHAIN_BROKEN at line {line}: {reason}")
        }
    }
}
