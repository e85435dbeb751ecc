//! Client side of SCRAM-SHA-256 (RFC 5802, RFC 7677) as PostgreSQL runs it:
//! no channel binding, and an empty user name in the client-first message
//! because the server takes the role from the startup packet.

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::errors::BackendError;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const MECHANISM: &str = "SCRAM-SHA-256";

/// "n,," : client does not support channel binding.
const GS2_HEADER: &str = "n,,";

const NONCE_BYTES: usize = 18;

type HmacSha256 = Hmac<Sha256>;

// -----------------------------------------------------------------------------
// ----- ScramClient -----------------------------------------------------------

/// One SCRAM exchange. Holds the nonce between the two round trips and the
/// server signature the final message must carry.
pub struct ScramClient {
    nonce: String,
    client_first_bare: String,
    server_signature: Option<[u8; 32]>,
}

impl ScramClient {
    pub fn new() -> Self {
        let bytes: [u8; NONCE_BYTES] = rand::random();
        Self::with_nonce("", STANDARD.encode(bytes))
    }

    pub fn with_nonce(user: &str, nonce: impl Into<String>) -> Self {
        let nonce = nonce.into();
        Self {
            client_first_bare: format!("n={user},r={nonce}"),
            nonce,
            server_signature: None,
        }
    }

    pub fn client_first(&self) -> String {
        format!("{GS2_HEADER}{}", self.client_first_bare)
    }

    /// Answer the server-first message with the client proof.
    pub fn client_final(&mut self, password: &str, server_first: &str) -> Result<String, BackendError> {
        let first = ServerFirst::parse(server_first)?;

        if first.nonce.len() <= self.nonce.len() || !first.nonce.starts_with(&self.nonce) {
            return Err(BackendError::protocol(
                "SCRAM server nonce does not extend the client nonce",
            ));
        }

        let salt = STANDARD
            .decode(first.salt)
            .map_err(|e| BackendError::protocol(format!("invalid SCRAM salt: {e}")))?;

        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, first.iterations, &mut salted);

        let client_key = hmac(&salted, b"Client Key");
        let stored_key = Sha256::digest(client_key);

        let without_proof = format!("c={},r={}", STANDARD.encode(GS2_HEADER), first.nonce);
        let auth_message = format!("{},{server_first},{without_proof}", self.client_first_bare);

        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (byte, mask) in proof.iter_mut().zip(client_signature) {
            *byte ^= mask;
        }

        let server_key = hmac(&salted, b"Server Key");
        self.server_signature = Some(hmac(&server_key, auth_message.as_bytes()));

        Ok(format!("{without_proof},p={}", STANDARD.encode(proof)))
    }

    /// Check the server-final message against the signature derived in
    /// [`ScramClient::client_final`].
    pub fn verify_server_final(&self, server_final: &str) -> Result<(), BackendError> {
        let Some(expected) = self.server_signature else {
            return Err(BackendError::protocol("SCRAM final message before continue"));
        };

        if let Some(reason) = server_final.strip_prefix("e=") {
            return Err(BackendError::rejected(format!(
                "SCRAM authentication failed: {reason}"
            )));
        }

        let verifier = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or_else(|| BackendError::protocol("SCRAM final message without verifier"))?;
        let received = STANDARD
            .decode(verifier)
            .map_err(|e| BackendError::protocol(format!("invalid SCRAM verifier: {e}")))?;

        if received.as_slice() != expected.as_slice() {
            return Err(BackendError::rejected("SCRAM server signature mismatch"));
        }
        Ok(())
    }
}

#[cfg(test)]
impl ScramClient {
    /// The server-final message a well-behaved server would send.
    pub fn expected_server_final(&self) -> Option<String> {
        self.server_signature
            .map(|signature| format!("v={}", STANDARD.encode(signature)))
    }
}

impl Default for ScramClient {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// ----- Internal --------------------------------------------------------------

struct ServerFirst<'a> {
    nonce: &'a str,
    salt: &'a str,
    iterations: u32,
}

impl<'a> ServerFirst<'a> {
    fn parse(message: &'a str) -> Result<Self, BackendError> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for attr in message.split(',') {
            match attr.split_once('=') {
                Some(("r", value)) => nonce = Some(value),
                Some(("s", value)) => salt = Some(value),
                Some(("i", value)) => iterations = value.parse::<u32>().ok().filter(|i| *i > 0),
                Some(("m", _)) => {
                    return Err(BackendError::protocol("SCRAM mandatory extension not supported"));
                }
                _ => {}
            }
        }

        match (nonce, salt, iterations) {
            (Some(nonce), Some(salt), Some(iterations)) => Ok(Self {
                nonce,
                salt,
                iterations,
            }),
            _ => Err(BackendError::protocol(format!(
                "malformed SCRAM server-first message: {message:?}"
            ))),
        }
    }
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);

    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

    #[test]
    fn rfc7677_exchange() {
        let mut client = ScramClient::with_nonce("user", NONCE);
        assert_eq!(client.client_first(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let last = client.client_final("pencil", SERVER_FIRST).unwrap();
        assert_eq!(
            last,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );

        client
            .verify_server_final("v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
    }

    #[test]
    fn wrong_server_signature_is_rejected() {
        let mut client = ScramClient::with_nonce("user", NONCE);
        client.client_final("pencil", SERVER_FIRST).unwrap();

        let err = client
            .verify_server_final("v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));

        let err = client.verify_server_final("e=invalid-proof").unwrap_err();
        assert!(err.to_string().contains("invalid-proof"));
    }

    #[test]
    fn server_nonce_must_extend_ours() {
        let mut client = ScramClient::with_nonce("", "abc");
        let err = client
            .client_final("pw", "r=xyz123,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
            .unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)));

        let err = client.client_final("pw", "r=abcdef,s=W22ZaJ0SNY7soEsUEjb6gQ==").unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)));
    }

    #[test]
    fn fresh_clients_use_distinct_nonces() {
        let a = ScramClient::new();
        let b = ScramClient::new();
        assert!(a.client_first().starts_with("n,,n=,r="));
        assert_ne!(a.client_first(), b.client_first());
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
