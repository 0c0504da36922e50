// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! Enrollment authenticator
//!
//! Pluggable authentication policies for enrollment sessions, keyed by
//! `(local IPCP id, N-1 flow port-id)`. Three policies are supported: none,
//! password (random challenge encrypted with a repeated-key XOR cipher) and
//! SSH-RSA option negotiation. A context lives no longer than the N-1 flow
//! whose port-id keys it; the flow-deallocated handler destroys it
//! unconditionally, and password sessions additionally carry a timeout.

use prost::Message;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cdap::{CdapMessage, CdapOpCode, CdapValue};
use crate::error::{IpcmError, WireError};
use crate::kernel::{KernelHandle, KernelRequest};
use crate::templates::{AuthProfile, PolicyConfig};

pub const AUTH_NONE: &str = "PSOC_authentication-none";
pub const AUTH_PASSWORD: &str = "PSOC_authentication-password";
pub const AUTH_SSHRSA: &str = "PSOC_authentication-sshrsa";

pub const DEFAULT_POLICY_VERSION: &str = "1";

/// Object classes of the password-policy CDAP objects.
pub const CHALLENGE_REQUEST: &str = "challenge request";
pub const CHALLENGE_REPLY: &str = "challenge reply";

/// Cipher applied when the profile does not name another one. Non-default
/// cipher names are accepted and recorded, but the challenge is still run
/// through the repeated-key XOR below.
pub const DEFAULT_CIPHER: &str = "default_cipher";

const PARAM_PASSWORD: &str = "password";
const PARAM_CIPHER: &str = "cipher";
const PARAM_CHALLENGE_LENGTH: &str = "challenge-length";

const PARAM_KEY_EXCHANGE_ALG: &str = "keyExchangeAlg";
const PARAM_ENCRYPTION_ALG: &str = "encryptAlg";
const PARAM_MAC_ALG: &str = "macAlg";
const PARAM_COMPRESSION_ALG: &str = "compressAlg";

/// Timeout for a pending password authentication, in milliseconds.
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 10_000;

/// Encrypts `data` with `key` using a repeated-key XOR. The transform is an
/// involution: applying it twice restores the input.
pub fn xor_cipher(data: &[u8], key: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(key.iter().cycle())
        .map(|(d, k)| d ^ k)
        .collect()
}

/// Generates a random alphanumeric challenge of the given length.
pub fn generate_challenge(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Algorithm selections negotiated by the SSH-RSA policy, carried as a
/// length-prefixed protobuf record.
#[derive(Clone, PartialEq, Message)]
pub struct SshRsaAuthOptions {
    #[prost(string, repeated, tag = "1")]
    pub key_exch_algs: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub encrypt_algs: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub mac_algs: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub compress_algs: Vec<String>,
}

impl SshRsaAuthOptions {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len() + 4);
        self.encode_length_delimited(&mut buf)
            .expect("vector write cannot fail");
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(Self::decode_length_delimited(bytes)?)
    }
}

/// Auth-policy body exchanged with the peer at enrollment start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPolicy {
    pub name: String,
    pub versions: Vec<String>,
    /// Encoded options blob (SSH-RSA only)
    pub options: Option<Vec<u8>>,
}

/// Result of driving an authentication session one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Successful,
    Failed,
    InProgress,
}

/// Identifies one enrollment session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub ipcp_id: u16,
    pub port_id: i32,
}

/// Per-policy state of a security context.
#[derive(Debug)]
enum ContextKind {
    None,
    Password {
        password: String,
        cipher: String,
        /// Challenge we issued; present on the requester side only
        challenge: Option<String>,
        timer: Option<JoinHandle<()>>,
    },
    SshRsa {
        key_exch_alg: String,
        encrypt_alg: String,
        mac_alg: String,
        compress_alg: String,
    },
}

/// Security context of one enrollment session.
#[derive(Debug)]
pub struct SecurityContext {
    pub key: SessionKey,
    pub crc_policy: PolicyConfig,
    pub ttl_policy: PolicyConfig,
    pub authenticated: bool,
    kind: ContextKind,
}

impl Drop for SecurityContext {
    fn drop(&mut self) {
        if let ContextKind::Password { timer: Some(t), .. } = &self.kind {
            t.abort();
        }
    }
}

/// The authenticator: one security context per live enrollment session.
#[derive(Debug)]
pub struct Authenticator {
    contexts: Mutex<HashMap<SessionKey, SecurityContext>>,
    kernel: KernelHandle,
    timeout: Duration,
}

impl Authenticator {
    pub fn new(kernel: KernelHandle) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            kernel,
            timeout: Duration::from_millis(DEFAULT_AUTH_TIMEOUT_MS),
        }
    }

    /// Builds the auth-policy body to send to the peer and records the
    /// session's security context.
    pub fn get_policy(
        &self,
        key: SessionKey,
        profile: &AuthProfile,
    ) -> Result<AuthPolicy, IpcmError> {
        let policy_name = profile.auth_policy.name.as_str();
        let versions = vec![profile.auth_policy.version.clone()];

        let (kind, options) = match policy_name {
            AUTH_NONE => (ContextKind::None, None),
            AUTH_PASSWORD => (self.password_kind(profile, None)?, None),
            AUTH_SSHRSA => {
                let kind = ssh_rsa_kind(profile);
                let options = match &kind {
                    ContextKind::SshRsa {
                        key_exch_alg,
                        encrypt_alg,
                        mac_alg,
                        compress_alg,
                    } => SshRsaAuthOptions {
                        key_exch_algs: vec![key_exch_alg.clone()],
                        encrypt_algs: vec![encrypt_alg.clone()],
                        mac_algs: vec![mac_alg.clone()],
                        compress_algs: vec![compress_alg.clone()],
                    }
                    .to_bytes(),
                    _ => unreachable!(),
                };
                (kind, Some(options))
            }
            other => {
                return Err(IpcmError::AuthenticationFailed(format!(
                    "unknown authentication policy {:?}",
                    other
                )));
            }
        };

        self.store(SecurityContext {
            key,
            crc_policy: profile.crc_policy.clone(),
            ttl_policy: profile.ttl_policy.clone(),
            authenticated: policy_name == AUTH_NONE,
            kind,
        });

        Ok(AuthPolicy {
            name: policy_name.to_string(),
            versions,
            options,
        })
    }

    /// Starts authenticating the peer that sent `policy`. Called on the
    /// membership side when an enrollment request arrives.
    pub fn initiate(
        self: &Arc<Self>,
        key: SessionKey,
        policy: &AuthPolicy,
        profile: &AuthProfile,
    ) -> AuthStatus {
        if policy.name != profile.auth_policy.name {
            warn!(policy = %policy.name, "wrong authentication policy name");
            return AuthStatus::Failed;
        }
        if policy.versions.first().map(|v| v.as_str()) != Some(DEFAULT_POLICY_VERSION) {
            warn!(versions = ?policy.versions, "unsupported authentication policy version");
            return AuthStatus::Failed;
        }

        match policy.name.as_str() {
            AUTH_NONE => {
                self.store(SecurityContext {
                    key,
                    crc_policy: profile.crc_policy.clone(),
                    ttl_policy: profile.ttl_policy.clone(),
                    authenticated: true,
                    kind: ContextKind::None,
                });
                AuthStatus::Successful
            }
            AUTH_PASSWORD => {
                let challenge_length = match profile
                    .auth_policy
                    .param(PARAM_CHALLENGE_LENGTH)
                    .and_then(|v| v.parse::<usize>().ok())
                {
                    Some(n) if n > 0 => n,
                    _ => {
                        warn!("bad or missing challenge-length in auth profile");
                        return AuthStatus::Failed;
                    }
                };
                let challenge = generate_challenge(challenge_length);
                let cipher = profile
                    .auth_policy
                    .param(PARAM_CIPHER)
                    .unwrap_or(DEFAULT_CIPHER)
                    .to_string();
                let password = profile
                    .auth_policy
                    .param(PARAM_PASSWORD)
                    .unwrap_or_default()
                    .to_string();

                self.kernel.send(cdap_to_peer(
                    key,
                    CHALLENGE_REQUEST,
                    &cipher,
                    CdapValue::Str(challenge.clone()),
                ));

                let timer = {
                    let auth = Arc::clone(self);
                    let timeout = self.timeout;
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        auth.expire(key);
                    })
                };

                self.store(SecurityContext {
                    key,
                    crc_policy: profile.crc_policy.clone(),
                    ttl_policy: profile.ttl_policy.clone(),
                    authenticated: false,
                    kind: ContextKind::Password {
                        password,
                        cipher,
                        challenge: Some(challenge),
                        timer: Some(timer),
                    },
                });
                AuthStatus::InProgress
            }
            AUTH_SSHRSA => {
                let Some(options) = policy
                    .options
                    .as_deref()
                    .and_then(|b| SshRsaAuthOptions::from_bytes(b).ok())
                else {
                    warn!("missing or undecodable SSH-RSA options");
                    return AuthStatus::Failed;
                };
                let Some(kind) = agreed_ssh_rsa(&options) else {
                    warn!("peer offered an empty SSH-RSA algorithm list");
                    return AuthStatus::Failed;
                };
                self.store(SecurityContext {
                    key,
                    crc_policy: profile.crc_policy.clone(),
                    ttl_policy: profile.ttl_policy.clone(),
                    authenticated: false,
                    kind,
                });
                // Signature exchange and key derivation run in the worker.
                AuthStatus::InProgress
            }
            _ => AuthStatus::Failed,
        }
    }

    /// Drives a session with an incoming CDAP authentication message.
    pub fn process_incoming(&self, key: SessionKey, msg: &CdapMessage) -> AuthStatus {
        if msg.op_code != CdapOpCode::MWrite {
            warn!(op = %msg.op_code, "wrong operation type for authentication message");
            return AuthStatus::Failed;
        }
        let Some(value) = &msg.obj_value else {
            warn!("authentication message without object value");
            return AuthStatus::Failed;
        };

        let mut contexts = self.contexts.lock().expect("auth context lock poisoned");
        let Some(ctx) = contexts.get_mut(&key) else {
            warn!(ipcp = key.ipcp_id, port = key.port_id,
                  "no pending security context for session");
            return AuthStatus::Failed;
        };

        match &mut ctx.kind {
            // No authentication messages are ever exchanged for this policy.
            ContextKind::None => {
                warn!("authentication message on a no-auth session");
                AuthStatus::Failed
            }
            ContextKind::Password {
                password,
                cipher,
                challenge,
                timer,
            } => match msg.obj_class.as_str() {
                CHALLENGE_REQUEST => {
                    let Some(plain) = value.as_str() else {
                        warn!("challenge request value of wrong type");
                        return AuthStatus::Failed;
                    };
                    let ciphertext = xor_cipher(plain.as_bytes(), password.as_bytes());
                    self.kernel.send(cdap_to_peer(
                        key,
                        CHALLENGE_REPLY,
                        cipher,
                        CdapValue::Bytes(ciphertext),
                    ));
                    AuthStatus::InProgress
                }
                CHALLENGE_REPLY => {
                    if let Some(t) = timer.take() {
                        t.abort();
                    }
                    let recovered = xor_cipher(value.as_bytes(), password.as_bytes());
                    if challenge.as_deref().map(|c| c.as_bytes()) == Some(recovered.as_slice()) {
                        ctx.authenticated = true;
                        AuthStatus::Successful
                    } else {
                        debug!("authentication failed, challenge mismatch");
                        AuthStatus::Failed
                    }
                }
                other => {
                    warn!(class = other, "wrong message type for password authentication");
                    AuthStatus::Failed
                }
            },
            ContextKind::SshRsa { .. } => {
                warn!("SSH-RSA handshake messages are handled by the worker");
                AuthStatus::Failed
            }
        }
    }

    /// Destroys the context for a deallocated N-1 flow. Always safe to call.
    pub fn flow_deallocated(&self, key: SessionKey) {
        if self
            .contexts
            .lock()
            .expect("auth context lock poisoned")
            .remove(&key)
            .is_some()
        {
            debug!(ipcp = key.ipcp_id, port = key.port_id,
                   "destroyed security context for deallocated flow");
        }
    }

    /// Timer path: the pending session timed out.
    fn expire(&self, key: SessionKey) {
        if self
            .contexts
            .lock()
            .expect("auth context lock poisoned")
            .remove(&key)
            .is_some()
        {
            warn!(ipcp = key.ipcp_id, port = key.port_id,
                  "authentication timed out, dropping security context");
        }
    }

    pub fn has_context(&self, key: SessionKey) -> bool {
        self.contexts
            .lock()
            .expect("auth context lock poisoned")
            .contains_key(&key)
    }

    pub fn is_authenticated(&self, key: SessionKey) -> bool {
        self.contexts
            .lock()
            .expect("auth context lock poisoned")
            .get(&key)
            .map(|c| c.authenticated)
            .unwrap_or(false)
    }

    /// Agreed SSH-RSA algorithms of a session, as
    /// `(key-exchange, encryption, mac, compression)`.
    pub fn ssh_algorithms(&self, key: SessionKey) -> Option<(String, String, String, String)> {
        let contexts = self.contexts.lock().expect("auth context lock poisoned");
        match &contexts.get(&key)?.kind {
            ContextKind::SshRsa {
                key_exch_alg,
                encrypt_alg,
                mac_alg,
                compress_alg,
            } => Some((
                key_exch_alg.clone(),
                encrypt_alg.clone(),
                mac_alg.clone(),
                compress_alg.clone(),
            )),
            _ => None,
        }
    }

    fn password_kind(
        &self,
        profile: &AuthProfile,
        challenge: Option<String>,
    ) -> Result<ContextKind, IpcmError> {
        profile
            .auth_policy
            .param(PARAM_CHALLENGE_LENGTH)
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                IpcmError::AuthenticationFailed("bad challenge-length in auth profile".to_string())
            })?;
        Ok(ContextKind::Password {
            password: profile
                .auth_policy
                .param(PARAM_PASSWORD)
                .unwrap_or_default()
                .to_string(),
            cipher: profile
                .auth_policy
                .param(PARAM_CIPHER)
                .unwrap_or(DEFAULT_CIPHER)
                .to_string(),
            challenge,
            timer: None,
        })
    }

    fn store(&self, ctx: SecurityContext) {
        self.contexts
            .lock()
            .expect("auth context lock poisoned")
            .insert(ctx.key, ctx);
    }
}

fn ssh_rsa_kind(profile: &AuthProfile) -> ContextKind {
    let param = |key: &str| profile.auth_policy.param(key).unwrap_or_default().to_string();
    ContextKind::SshRsa {
        key_exch_alg: param(PARAM_KEY_EXCHANGE_ALG),
        encrypt_alg: param(PARAM_ENCRYPTION_ALG),
        mac_alg: param(PARAM_MAC_ALG),
        compress_alg: param(PARAM_COMPRESSION_ALG),
    }
}

fn agreed_ssh_rsa(options: &SshRsaAuthOptions) -> Option<ContextKind> {
    Some(ContextKind::SshRsa {
        key_exch_alg: options.key_exch_algs.first()?.clone(),
        encrypt_alg: options.encrypt_algs.first()?.clone(),
        mac_alg: options.mac_algs.first()?.clone(),
        compress_alg: options.compress_algs.first()?.clone(),
    })
}

fn cdap_to_peer(key: SessionKey, class: &str, cipher: &str, value: CdapValue) -> KernelRequest {
    let msg = CdapMessage::write(class, cipher, value);
    KernelRequest::SendCdap {
        ipcp_id: key.ipcp_id,
        port_id: key.port_id,
        frame: msg.to_frame().unwrap_or_default(),
    }
}
