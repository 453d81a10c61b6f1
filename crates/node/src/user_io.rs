//! User line protocol.
//!
//! JSON objects, one per line, over plain TCP (the TLS/WebSocket front
//! is an external concern). Connect flow mirrors the peer handshake:
//! the server sends a random challenge, the user answers with its
//! pubkey and a signature over the challenge bytes; only then are
//! inputs accepted.

use hotpocket_types::{
    epoch_millis, Hash, InputStatus, Protocol, PublicKey, Signature, UserInput, UserOutput,
};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// A verified user submission delivered to the runner.
#[derive(Debug)]
pub enum UserInbound {
    /// `submit_contract_input`.
    Input(UserInput),
    /// `contract_read_request`: answered out-of-band by the runner.
    ReadRequest {
        pubkey: PublicKey,
        session_id: u64,
        blob: Vec<u8>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserLine {
    ChallengeResponse {
        pubkey: String,
        sig: String,
    },
    SubmitContractInput {
        nonce: u64,
        blob: String,
        sig: String,
    },
    ContractReadRequest {
        blob: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerLine<'a> {
    UserChallenge {
        challenge: String,
    },
    ChallengeStatus {
        status: &'a str,
    },
    SubmissionStatus {
        input_hash: String,
        status: InputStatus,
    },
    ContractOutput {
        seq_no: u64,
        outputs: Vec<String>,
    },
    ContractReadResponse {
        content: String,
    },
}

struct UserSession {
    tx: mpsc::Sender<String>,
    pubkey: PublicKey,
}

/// The user-facing server.
pub struct UserServer {
    sessions: Arc<Mutex<HashMap<u64, UserSession>>>,
    next_session_id: Arc<AtomicU64>,
    inbound_tx: mpsc::Sender<UserInbound>,
    /// Malformed lines tolerated per accounting minute before the
    /// connection is dropped (0 = unlimited).
    max_bad_msgs_per_min: u32,
}

impl UserServer {
    /// Bind and start accepting users.
    pub async fn start(
        port: u16,
        max_bad_msgs_per_min: u32,
    ) -> std::io::Result<(Arc<Self>, mpsc::Receiver<UserInbound>)> {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let server = Arc::new(Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_session_id: Arc::new(AtomicU64::new(1)),
            inbound_tx,
            max_bad_msgs_per_min,
        });

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "User server listening");

        let accept = Arc::clone(&server);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        trace!(%addr, "User connected");
                        let server = Arc::clone(&accept);
                        tokio::spawn(async move {
                            if let Err(e) = server.run_session(stream).await {
                                trace!(%addr, error = %e, "User session ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "User accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                    }
                }
            }
        });

        Ok((server, inbound_rx))
    }

    /// Report a submission status to every session of the user.
    pub async fn send_status(&self, pubkey: PublicKey, input_hash: Hash, status: InputStatus) {
        let line = json_line(&ServerLine::SubmissionStatus {
            input_hash: input_hash.to_hex(),
            status,
        });
        self.send_to_user(pubkey, line).await;
    }

    /// Deliver a committed round's outputs to their addressees.
    pub async fn send_outputs(&self, seq_no: u64, outputs: &[UserOutput]) {
        for output in outputs {
            let line = json_line(&ServerLine::ContractOutput {
                seq_no,
                outputs: output.buffers.iter().map(hex::encode).collect(),
            });
            self.send_to_user(output.pubkey, line).await;
        }
    }

    /// Answer a read request on its session.
    pub async fn send_read_response(&self, session_id: u64, content: Vec<u8>) {
        let line = json_line(&ServerLine::ContractReadResponse {
            content: hex::encode(content),
        });
        let tx = self.sessions.lock().get(&session_id).map(|s| s.tx.clone());
        if let Some(tx) = tx {
            let _ = tx.send(line).await;
        }
    }

    async fn send_to_user(&self, pubkey: PublicKey, line: String) {
        let targets: Vec<mpsc::Sender<String>> = self
            .sessions
            .lock()
            .values()
            .filter(|s| s.pubkey == pubkey)
            .map(|s| s.tx.clone())
            .collect();
        for tx in targets {
            let _ = tx.send(line.clone()).await;
        }
    }

    async fn run_session(&self, stream: TcpStream) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        // Challenge first; nothing else is accepted before it verifies.
        let mut challenge = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        let hello = json_line(&ServerLine::UserChallenge {
            challenge: hex::encode(challenge),
        });
        writer.write_all(hello.as_bytes()).await?;

        let pubkey = loop {
            let Some(line) = lines.next_line().await? else {
                return Ok(());
            };
            match serde_json::from_str::<UserLine>(&line) {
                Ok(UserLine::ChallengeResponse { pubkey, sig }) => {
                    let Some((pk, sig)) = parse_key_sig(&pubkey, &sig) else {
                        debug!("Malformed user challenge response");
                        return Ok(());
                    };
                    if pk.verify(&challenge, &sig).is_err() {
                        debug!("User challenge signature failed");
                        let line = json_line(&ServerLine::ChallengeStatus { status: "denied" });
                        let _ = writer.write_all(line.as_bytes()).await;
                        return Ok(());
                    }
                    let line = json_line(&ServerLine::ChallengeStatus { status: "verified" });
                    writer.write_all(line.as_bytes()).await?;
                    break pk;
                }
                _ => {
                    debug!("Expected challenge response, dropping user");
                    return Ok(());
                }
            }
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut outbound_rx) = mpsc::channel::<String>(64);
        self.sessions
            .lock()
            .insert(session_id, UserSession { tx, pubkey });
        debug!(session_id, user = ?pubkey, "User session verified");

        let write_task = tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        // Input phase. Malformed lines count against the per-minute
        // budget; past it the connection is dropped.
        let mut bad_msgs: u32 = 0;
        let mut bad_window_start = epoch_millis();
        let result = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            let mut bad_line = false;
            match serde_json::from_str::<UserLine>(&line) {
                Ok(UserLine::SubmitContractInput { nonce, blob, sig }) => {
                    match (hex::decode(&blob).ok(), parse_sig(&sig)) {
                        (Some(blob), Some(sig)) => {
                            let input = UserInput {
                                pubkey,
                                input_container: blob,
                                sig,
                                protocol: Protocol::Json,
                                nonce,
                            };
                            if self
                                .inbound_tx
                                .send(UserInbound::Input(input))
                                .await
                                .is_err()
                            {
                                break Ok(());
                            }
                        }
                        _ => bad_line = true,
                    }
                }
                Ok(UserLine::ContractReadRequest { blob }) => match hex::decode(&blob).ok() {
                    Some(blob) => {
                        if self
                            .inbound_tx
                            .send(UserInbound::ReadRequest {
                                pubkey,
                                session_id,
                                blob,
                            })
                            .await
                            .is_err()
                        {
                            break Ok(());
                        }
                    }
                    None => bad_line = true,
                },
                Ok(UserLine::ChallengeResponse { .. }) | Err(_) => bad_line = true,
            }

            if bad_line && self.max_bad_msgs_per_min > 0 {
                let now = epoch_millis();
                if now.saturating_sub(bad_window_start) > 60_000 {
                    bad_window_start = now;
                    bad_msgs = 0;
                }
                bad_msgs += 1;
                trace!(session_id, bad_msgs, "Malformed user line");
                if bad_msgs > self.max_bad_msgs_per_min {
                    debug!(session_id, "User exceeded bad-message budget, dropping");
                    break Ok(());
                }
            }
        };

        self.sessions.lock().remove(&session_id);
        write_task.abort();
        result
    }
}

fn json_line<T: Serialize>(value: &T) -> String {
    let mut line = serde_json::to_string(value).expect("server line serialize");
    line.push('\n');
    line
}

fn parse_key_sig(pubkey: &str, sig: &str) -> Option<(PublicKey, Signature)> {
    Some((PublicKey::from_hex(pubkey).ok()?, parse_sig(sig)?))
}

fn parse_sig(sig: &str) -> Option<Signature> {
    let bytes = hex::decode(sig).ok()?;
    let arr: [u8; 64] = bytes.try_into().ok()?;
    Some(Signature(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotpocket_types::test_utils::test_keypair;
    use serde_json::Value;
    use tokio::io::AsyncReadExt;

    async fn read_json(stream: &mut TcpStream) -> Value {
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        serde_json::from_str(text.lines().next().unwrap()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn challenge_then_input_flow() {
        let (server, mut inbound) = UserServer::start(38901, 200).await.unwrap();
        let _ = &server;

        let mut client = TcpStream::connect("127.0.0.1:38901").await.unwrap();
        let hello = read_json(&mut client).await;
        assert_eq!(hello["type"], "user_challenge");
        let challenge = hex::decode(hello["challenge"].as_str().unwrap()).unwrap();

        let kp = test_keypair(5);
        let answer = serde_json::json!({
            "type": "challenge_response",
            "pubkey": kp.public_key().to_hex(),
            "sig": hex::encode(kp.sign(&challenge).as_bytes()),
        });
        client
            .write_all(format!("{answer}\n").as_bytes())
            .await
            .unwrap();
        let status = read_json(&mut client).await;
        assert_eq!(status["status"], "verified");

        let payload = b"hello contract".to_vec();
        let submit = serde_json::json!({
            "type": "submit_contract_input",
            "nonce": 1,
            "blob": hex::encode(&payload),
            "sig": hex::encode(kp.sign(&payload).as_bytes()),
        });
        client
            .write_all(format!("{submit}\n").as_bytes())
            .await
            .unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(2), inbound.recv())
            .await
            .expect("timeout")
            .expect("closed");
        match received {
            UserInbound::Input(input) => {
                assert_eq!(input.pubkey, kp.public_key());
                assert_eq!(input.input_container, payload);
                assert_eq!(input.nonce, 1);
                assert!(input.verify().is_ok());
            }
            other => panic!("unexpected inbound: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_challenge_signature_is_denied() {
        let (_server, mut inbound) = UserServer::start(38902, 200).await.unwrap();

        let mut client = TcpStream::connect("127.0.0.1:38902").await.unwrap();
        let _hello = read_json(&mut client).await;

        let kp = test_keypair(6);
        let answer = serde_json::json!({
            "type": "challenge_response",
            "pubkey": kp.public_key().to_hex(),
            "sig": hex::encode(kp.sign(b"the wrong bytes").as_bytes()),
        });
        client
            .write_all(format!("{answer}\n").as_bytes())
            .await
            .unwrap();
        let status = read_json(&mut client).await;
        assert_eq!(status["status"], "denied");

        // No input ever reaches the runner from a denied session.
        let result =
            tokio::time::timeout(std::time::Duration::from_millis(300), inbound.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_message_budget_drops_the_session() {
        let (_server, _inbound) = UserServer::start(38903, 2).await.unwrap();

        let mut client = TcpStream::connect("127.0.0.1:38903").await.unwrap();
        let hello = read_json(&mut client).await;
        let challenge = hex::decode(hello["challenge"].as_str().unwrap()).unwrap();

        let kp = test_keypair(7);
        let answer = serde_json::json!({
            "type": "challenge_response",
            "pubkey": kp.public_key().to_hex(),
            "sig": hex::encode(kp.sign(&challenge).as_bytes()),
        });
        client
            .write_all(format!("{answer}\n").as_bytes())
            .await
            .unwrap();
        let status = read_json(&mut client).await;
        assert_eq!(status["status"], "verified");

        // Three garbage lines blow the budget of two.
        for _ in 0..3 {
            client.write_all(b"not json at all\n").await.unwrap();
        }

        // The server closes the connection; the read eventually hits EOF.
        let mut buf = [0u8; 64];
        let closed = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                match client.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "session should have been dropped");
    }
}
