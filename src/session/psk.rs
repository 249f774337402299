//! Pre-shared-key sessions
//!
//! rustls has no external-PSK mode, so PSK connections use a small
//! authenticated handshake of their own:
//!
//! ```text
//! Client                                            Server
//! ClientHello { identity, random, x25519, ciphers } ──▶
//!                ◀── ServerHello { random, x25519, cipher, verify }
//! ClientFinished { verify }                         ──▶
//! ```
//!
//! Keys come from HKDF-SHA256 over `psk || ecdhe`, salted with both randoms,
//! so a peer without the key cannot produce either verify MAC. Every record
//! is `type(1) || len(2)`; after the handshake bodies are sealed with the
//! negotiated AEAD, using the header as associated data and the record
//! sequence number as nonce.

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, warn};

use super::{Readable, RecordLayer, TlsConfig};
use crate::crypto::{self, AeadCipher, CipherKind, EphemeralX25519, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

const RECORD_HANDSHAKE: u8 = 22;
const RECORD_ALERT: u8 = 21;
const RECORD_DATA: u8 = 23;

const HEADER_LEN: usize = 3;
/// Largest plaintext per record
const MAX_FRAGMENT: usize = 16 * 1024;
const MAX_RECORD: usize = MAX_FRAGMENT + TAG_SIZE;

const MSG_CLIENT_HELLO: u8 = 1;
const MSG_SERVER_HELLO: u8 = 2;
const MSG_CLIENT_FINISHED: u8 = 3;

const ALERT_WARNING: u8 = 1;
const ALERT_FATAL: u8 = 2;
const ALERT_CLOSE_NOTIFY: u8 = 0;
const ALERT_UNEXPECTED_MESSAGE: u8 = 10;
const ALERT_HANDSHAKE_FAILURE: u8 = 40;
const ALERT_DECRYPT_ERROR: u8 = 51;
const ALERT_UNKNOWN_PSK_IDENTITY: u8 = 115;

const KEY_SCHEDULE_LABEL: &[u8] = b"loomwire psk v1";

struct TrafficKeys {
    seal: AeadCipher,
    seal_iv: [u8; NONCE_SIZE],
    open: AeadCipher,
    open_iv: [u8; NONCE_SIZE],
}

struct KeySchedule {
    client_key: Vec<u8>,
    server_key: Vec<u8>,
    client_iv: [u8; NONCE_SIZE],
    server_iv: [u8; NONCE_SIZE],
    finished_key: Vec<u8>,
}

impl KeySchedule {
    fn derive(psk: &[u8], shared: &[u8; 32], client_random: &[u8], server_random: &[u8]) -> Result<Self> {
        let mut ikm = Vec::with_capacity(psk.len() + shared.len());
        ikm.extend_from_slice(psk);
        ikm.extend_from_slice(shared);
        let mut salt = Vec::with_capacity(64);
        salt.extend_from_slice(client_random);
        salt.extend_from_slice(server_random);

        let expand = |label: &str, len: usize| {
            let mut info = KEY_SCHEDULE_LABEL.to_vec();
            info.extend_from_slice(label.as_bytes());
            crypto::derive_key(&ikm, &salt, &info, len)
        };
        Ok(Self {
            client_key: expand(" client key", 32)?,
            server_key: expand(" server key", 32)?,
            client_iv: to_iv(&expand(" client iv", NONCE_SIZE)?),
            server_iv: to_iv(&expand(" server iv", NONCE_SIZE)?),
            finished_key: expand(" finished", 32)?,
        })
    }

    fn traffic(&self, kind: CipherKind, is_client: bool) -> Result<TrafficKeys> {
        let client = AeadCipher::new(kind, &self.client_key)?;
        let server = AeadCipher::new(kind, &self.server_key)?;
        Ok(if is_client {
            TrafficKeys {
                seal: client,
                seal_iv: self.client_iv,
                open: server,
                open_iv: self.server_iv,
            }
        } else {
            TrafficKeys {
                seal: server,
                seal_iv: self.server_iv,
                open: client,
                open_iv: self.client_iv,
            }
        })
    }

    fn verify_data(&self, label: &[u8], transcript: &[u8]) -> Result<[u8; 32]> {
        let mut data = label.to_vec();
        data.extend_from_slice(&crypto::sha256(transcript));
        crypto::hmac_sha256(&self.finished_key, &data)
    }

    fn check_verify_data(&self, label: &[u8], transcript: &[u8], tag: &[u8]) -> Result<bool> {
        let mut data = label.to_vec();
        data.extend_from_slice(&crypto::sha256(transcript));
        crypto::verify_hmac_sha256(&self.finished_key, &data, tag)
    }
}

fn to_iv(bytes: &[u8]) -> [u8; NONCE_SIZE] {
    let mut iv = [0u8; NONCE_SIZE];
    iv.copy_from_slice(&bytes[..NONCE_SIZE]);
    iv
}

fn nonce(iv: &[u8; NONCE_SIZE], seq: u64) -> [u8; NONCE_SIZE] {
    let mut out = *iv;
    for (byte, s) in out[NONCE_SIZE - 8..].iter_mut().zip(seq.to_be_bytes()) {
        *byte ^= s;
    }
    out
}

enum Phase {
    /// Client sent ClientHello
    AwaitServerHello {
        share: EphemeralX25519,
        client_random: [u8; 32],
        transcript: Vec<u8>,
    },
    /// Server waiting for ClientHello
    AwaitClientHello,
    /// Server sent ServerHello
    AwaitClientFinished {
        schedule: KeySchedule,
        transcript: Vec<u8>,
    },
    Established,
    Failed,
}

pub(crate) struct PskSession {
    is_client: bool,
    identity: String,
    key: Vec<u8>,
    ciphers: Vec<CipherKind>,
    phase: Phase,
    keys: Option<TrafficKeys>,
    tx_seq: u64,
    rx_seq: u64,
    incoming: BytesMut,
    outgoing: Vec<u8>,
    plaintext: BytesMut,
    peer_closed: bool,
    closed: bool,
    /// Records are sealed from here on
    established: bool,
    alert_sent: bool,
}

impl PskSession {
    pub fn client(config: &TlsConfig) -> Result<Self> {
        let mut session = Self::new(config, true)?;
        let share = EphemeralX25519::generate();
        let client_random = crypto::random_32();

        let mut hello = Vec::new();
        hello.put_u8(MSG_CLIENT_HELLO);
        hello.put_u8(session.identity.len() as u8);
        hello.extend_from_slice(session.identity.as_bytes());
        hello.extend_from_slice(&client_random);
        hello.extend_from_slice(&share.public_key_bytes());
        hello.put_u8(session.ciphers.len() as u8);
        for cipher in &session.ciphers {
            hello.put_u8(cipher.id());
        }
        session.push_record(RECORD_HANDSHAKE, &hello);
        session.phase = Phase::AwaitServerHello {
            share,
            client_random,
            transcript: hello,
        };
        Ok(session)
    }

    pub fn server(config: &TlsConfig) -> Result<Self> {
        Self::new(config, false)
    }

    fn new(config: &TlsConfig, is_client: bool) -> Result<Self> {
        let psk = config
            .psk()
            .ok_or_else(|| Error::Config("configuration has no pre-shared key".into()))?;
        Ok(Self {
            is_client,
            identity: psk.identity.clone(),
            key: psk.key.clone(),
            ciphers: config.psk_ciphers().to_vec(),
            phase: Phase::AwaitClientHello,
            keys: None,
            tx_seq: 0,
            rx_seq: 0,
            incoming: BytesMut::new(),
            outgoing: Vec::new(),
            plaintext: BytesMut::new(),
            peer_closed: false,
            closed: false,
            established: false,
            alert_sent: false,
        })
    }

    fn role(&self) -> &'static str {
        if self.is_client {
            "client"
        } else {
            "server"
        }
    }

    fn push_record(&mut self, kind: u8, body: &[u8]) {
        self.outgoing.put_u8(kind);
        self.outgoing.put_u16(body.len() as u16);
        self.outgoing.extend_from_slice(body);
    }

    fn push_sealed(&mut self, kind: u8, plaintext: &[u8]) -> Result<()> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| Error::State("session keys not established".into()))?;
        let header = [
            kind,
            ((plaintext.len() + TAG_SIZE) >> 8) as u8,
            (plaintext.len() + TAG_SIZE) as u8,
        ];
        let sealed = keys
            .seal
            .seal(&nonce(&keys.seal_iv, self.tx_seq), plaintext, &header)?;
        self.tx_seq = self
            .tx_seq
            .checked_add(1)
            .ok_or_else(|| Error::Protocol("record sequence exhausted".into()))?;
        self.outgoing.extend_from_slice(&header);
        self.outgoing.extend_from_slice(&sealed);
        Ok(())
    }

    /// Queue a fatal alert and fail the session
    fn fail(&mut self, code: u8, reason: String) -> Error {
        warn!("PSK {} session {} failed: {}", self.role(), self.identity, reason);
        if !self.alert_sent {
            self.alert_sent = true;
            if self.established {
                let _ = self.push_sealed(RECORD_ALERT, &[ALERT_FATAL, code]);
            } else {
                self.push_record(RECORD_ALERT, &[ALERT_FATAL, code]);
            }
        }
        self.phase = Phase::Failed;
        Error::HandshakeFailed(reason)
    }

    fn on_record(&mut self, kind: u8, header: [u8; HEADER_LEN], body: &[u8]) -> Result<()> {
        match kind {
            RECORD_HANDSHAKE => self.on_handshake(body),
            RECORD_ALERT if !self.established => self.on_alert(body),
            RECORD_ALERT | RECORD_DATA if self.established => {
                let plain = self.open(header, body)?;
                if kind == RECORD_ALERT {
                    self.on_alert(&plain)
                } else {
                    self.plaintext.extend_from_slice(&plain);
                    Ok(())
                }
            }
            _ => Err(self.fail(
                ALERT_UNEXPECTED_MESSAGE,
                format!("unexpected record type {}", kind),
            )),
        }
    }

    fn open(&mut self, header: [u8; HEADER_LEN], body: &[u8]) -> Result<Vec<u8>> {
        let opened = match &self.keys {
            Some(keys) => keys.open.open(&nonce(&keys.open_iv, self.rx_seq), body, &header),
            None => Err(Error::State("session keys not established".into())),
        };
        match opened {
            Ok(plain) => {
                self.rx_seq += 1;
                Ok(plain)
            }
            Err(_) => Err(self.fail(ALERT_DECRYPT_ERROR, "record authentication failed".into())),
        }
    }

    fn on_alert(&mut self, body: &[u8]) -> Result<()> {
        let (level, code) = match body {
            [level, code] => (*level, *code),
            _ => return Err(self.fail(ALERT_DECRYPT_ERROR, "malformed alert".into())),
        };
        if code == ALERT_CLOSE_NOTIFY && matches!(self.phase, Phase::Established) {
            debug!("Peer {} sent close_notify", self.identity);
            self.peer_closed = true;
            return Ok(());
        }
        self.phase = Phase::Failed;
        self.alert_sent = true;
        Err(Error::HandshakeFailed(format!(
            "peer sent alert {} (level {})",
            code, level
        )))
    }

    fn on_handshake(&mut self, body: &[u8]) -> Result<()> {
        let phase = std::mem::replace(&mut self.phase, Phase::Failed);
        match (phase, body.first().copied()) {
            (Phase::AwaitClientHello, Some(MSG_CLIENT_HELLO)) => self.on_client_hello(body),
            (
                Phase::AwaitServerHello {
                    share,
                    client_random,
                    transcript,
                },
                Some(MSG_SERVER_HELLO),
            ) => self.on_server_hello(body, share, client_random, transcript),
            (
                Phase::AwaitClientFinished {
                    schedule,
                    transcript,
                },
                Some(MSG_CLIENT_FINISHED),
            ) => self.on_client_finished(body, schedule, transcript),
            (_, msg) => Err(self.fail(
                ALERT_UNEXPECTED_MESSAGE,
                format!("unexpected handshake message {:?}", msg),
            )),
        }
    }

    fn on_client_hello(&mut self, body: &[u8]) -> Result<()> {
        let mut rd = &body[1..];
        let malformed = |s: &mut Self| s.fail(ALERT_HANDSHAKE_FAILURE, "malformed ClientHello".into());

        if rd.remaining() < 1 {
            return Err(malformed(self));
        }
        let id_len = rd.get_u8() as usize;
        if rd.remaining() < id_len + 64 + 1 {
            return Err(malformed(self));
        }
        let identity = rd[..id_len].to_vec();
        rd.advance(id_len);
        let mut client_random = [0u8; 32];
        rd.copy_to_slice(&mut client_random);
        let mut peer_share = [0u8; 32];
        rd.copy_to_slice(&mut peer_share);
        let n_ciphers = rd.get_u8() as usize;
        if rd.remaining() != n_ciphers {
            return Err(malformed(self));
        }
        let offered: Vec<CipherKind> = rd.iter().filter_map(|id| CipherKind::from_id(*id)).collect();

        if identity != self.identity.as_bytes() {
            return Err(self.fail(
                ALERT_UNKNOWN_PSK_IDENTITY,
                format!("unknown PSK identity {}", String::from_utf8_lossy(&identity)),
            ));
        }
        let cipher = match self.ciphers.iter().copied().find(|c| offered.contains(c)) {
            Some(cipher) => cipher,
            None => return Err(self.fail(ALERT_HANDSHAKE_FAILURE, "no common PSK cipher".into())),
        };

        let share = EphemeralX25519::generate();
        let server_random = crypto::random_32();
        let server_share = share.public_key_bytes();
        let shared = match share.exchange(&peer_share) {
            Ok(shared) => shared,
            Err(e) => return Err(self.fail(ALERT_HANDSHAKE_FAILURE, e.to_string())),
        };
        let schedule = KeySchedule::derive(&self.key, &shared, &client_random, &server_random)?;

        let mut hello = Vec::new();
        hello.put_u8(MSG_SERVER_HELLO);
        hello.extend_from_slice(&server_random);
        hello.extend_from_slice(&server_share);
        hello.put_u8(cipher.id());

        let mut transcript = body.to_vec();
        transcript.extend_from_slice(&hello);
        let verify = schedule.verify_data(b"server finished", &transcript)?;
        hello.extend_from_slice(&verify);
        transcript.extend_from_slice(&verify);

        self.push_record(RECORD_HANDSHAKE, &hello);
        self.keys = Some(schedule.traffic(cipher, false)?);
        self.phase = Phase::AwaitClientFinished {
            schedule,
            transcript,
        };
        Ok(())
    }

    fn on_server_hello(
        &mut self,
        body: &[u8],
        share: EphemeralX25519,
        client_random: [u8; 32],
        mut transcript: Vec<u8>,
    ) -> Result<()> {
        if body.len() != 1 + 32 + 32 + 1 + 32 {
            return Err(self.fail(ALERT_HANDSHAKE_FAILURE, "malformed ServerHello".into()));
        }
        let server_random = &body[1..33];
        let mut peer_share = [0u8; 32];
        peer_share.copy_from_slice(&body[33..65]);
        let cipher = match CipherKind::from_id(body[65]) {
            Some(c) if self.ciphers.contains(&c) => c,
            _ => return Err(self.fail(ALERT_HANDSHAKE_FAILURE, "server chose unknown cipher".into())),
        };
        let verify = &body[66..];

        let shared = match share.exchange(&peer_share) {
            Ok(shared) => shared,
            Err(e) => return Err(self.fail(ALERT_HANDSHAKE_FAILURE, e.to_string())),
        };
        let schedule = KeySchedule::derive(&self.key, &shared, &client_random, server_random)?;

        transcript.extend_from_slice(&body[..66]);
        if !schedule.check_verify_data(b"server finished", &transcript, verify)? {
            return Err(self.fail(ALERT_DECRYPT_ERROR, "server verify MAC mismatch".into()));
        }
        transcript.extend_from_slice(verify);

        let client_verify = schedule.verify_data(b"client finished", &transcript)?;
        let mut finished = vec![MSG_CLIENT_FINISHED];
        finished.extend_from_slice(&client_verify);
        self.push_record(RECORD_HANDSHAKE, &finished);

        self.keys = Some(schedule.traffic(cipher, true)?);
        self.phase = Phase::Established;
        self.established = true;
        debug!("PSK session {} established ({:?})", self.identity, cipher);
        Ok(())
    }

    fn on_client_finished(
        &mut self,
        body: &[u8],
        schedule: KeySchedule,
        transcript: Vec<u8>,
    ) -> Result<()> {
        if body.len() != 33 || !schedule.check_verify_data(b"client finished", &transcript, &body[1..])? {
            return Err(self.fail(ALERT_DECRYPT_ERROR, "client verify MAC mismatch".into()));
        }
        self.phase = Phase::Established;
        self.established = true;
        debug!("PSK session {} established", self.identity);
        Ok(())
    }
}

impl RecordLayer for PskSession {
    fn is_handshaking(&self) -> bool {
        !matches!(self.phase, Phase::Established | Phase::Failed)
    }

    fn feed(&mut self, data: &[u8]) -> Result<()> {
        if matches!(self.phase, Phase::Failed) {
            return Err(Error::HandshakeFailed("session failed".into()));
        }
        self.incoming.extend_from_slice(data);
        while self.incoming.len() >= HEADER_LEN {
            let kind = self.incoming[0];
            let len = u16::from_be_bytes([self.incoming[1], self.incoming[2]]) as usize;
            if len > MAX_RECORD {
                return Err(self.fail(ALERT_UNEXPECTED_MESSAGE, format!("record of {} bytes", len)));
            }
            if self.incoming.len() < HEADER_LEN + len {
                break;
            }
            let header = [kind, self.incoming[1], self.incoming[2]];
            self.incoming.advance(HEADER_LEN);
            let body = self.incoming.split_to(len);
            self.on_record(kind, header, &body)?;
        }
        Ok(())
    }

    fn wants_write(&self) -> bool {
        !self.outgoing.is_empty()
    }

    fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outgoing)
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> Result<Readable> {
        if !self.plaintext.is_empty() {
            let n = buf.len().min(self.plaintext.len());
            buf[..n].copy_from_slice(&self.plaintext[..n]);
            self.plaintext.advance(n);
            return Ok(Readable::Data(n));
        }
        if self.peer_closed {
            return Ok(Readable::Closed);
        }
        match self.phase {
            Phase::Failed => Err(Error::HandshakeFailed("session failed".into())),
            _ => Ok(Readable::Pending),
        }
    }

    fn write_plaintext(&mut self, data: &[u8]) -> Result<()> {
        if !self.established || self.closed || matches!(self.phase, Phase::Failed) {
            return Err(Error::State("PSK session not established".into()));
        }
        for chunk in data.chunks(MAX_FRAGMENT) {
            self.push_sealed(RECORD_DATA, chunk)?;
        }
        Ok(())
    }

    fn send_close(&mut self) {
        if self.established && !self.closed {
            self.closed = true;
            let _ = self.push_sealed(RECORD_ALERT, &[ALERT_WARNING, ALERT_CLOSE_NOTIFY]);
        }
    }

    fn peer_verified(&self) -> bool {
        matches!(self.phase, Phase::Established)
    }

    fn psk_identity(&self) -> Option<String> {
        Some(self.identity.clone())
    }
}
