use russh::client::Handler;
use russh::keys::PublicKeyBase64;
use tracing::{info, warn};

pub(crate) struct Client {
    pub allowed_fingerprints: Option<Vec<String>>, // OpenSSH SHA256 fingerprints or raw base64 keys
}

impl Client {
    pub fn new(allowed_fingerprints: Option<Vec<String>>) -> Self {
        Self { allowed_fingerprints }
    }

    fn accepts(&self, fp_sha256: &str, key_b64: &str) -> bool {
        match &self.allowed_fingerprints {
            Some(allowed) => allowed
                .iter()
                .map(|s| s.trim())
                .any(|s| s == fp_sha256 || s == key_b64),
            None => true,
        }
    }
}

impl Handler for Client {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fp_sha256 = server_public_key
            .fingerprint(russh::keys::HashAlg::Sha256)
            .to_string();
        if self.allowed_fingerprints.is_none() {
            info!("accepting server key {} (no fingerprint allow-list)", fp_sha256);
            return Ok(true);
        }
        let ok = self.accepts(&fp_sha256, &server_public_key.public_key_base64());
        if !ok {
            warn!("server key {} is not in the allow-list", fp_sha256);
        }
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_matches_fingerprint_or_key() {
        let client = Client::new(Some(vec![" SHA256:abc ".into(), "AAAAC3Nz".into()]));
        assert!(client.accepts("SHA256:abc", "other"));
        assert!(client.accepts("SHA256:zzz", "AAAAC3Nz"));
        assert!(!client.accepts("SHA256:zzz", "other"));
    }

    #[test]
    fn no_allow_list_accepts_anything() {
        assert!(Client::new(None).accepts("SHA256:any", "key"));
    }
}
