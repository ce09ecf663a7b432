//! Shared test fixtures: a throwaway PKI and a MockMysqlServer that speaks
//! the RDS IAM login flow (TLS upgrade, then an auth switch to
//! `mysql_clear_password`).

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};

pub const RDS_HOST: &str = "cluster.mydb.eu-west-1.rds.amazonaws.com";

const COM_QUIT: u8 = 0x01;
const CLEAR_PASSWORD_PLUGIN: &[u8] = b"mysql_clear_password\0";
const OK_PAYLOAD: [u8; 7] = [0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];

const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_SSL: u32 = 0x0000_0800;
const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
const CLIENT_PLUGIN_AUTH_LENENC: u32 = 0x0020_0000;

// ── PKI ──────────────────────────────────────────────────────────────

pub struct Pki {
    pub ca_pem: String,
    pub server_config: Arc<rustls::ServerConfig>,
}

/// A fresh CA and a server certificate for `host` signed by it.
pub fn pki_for(host: &str) -> Pki {
    let ca_key = rcgen::KeyPair::generate().unwrap();
    let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params.distinguished_name.push(rcgen::DnType::CommonName, "mock rds root");
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server_key = rcgen::KeyPair::generate().unwrap();
    let server_cert = rcgen::CertificateParams::new(vec![host.to_string()])
        .unwrap()
        .signed_by(&server_key, &ca_cert, &ca_key)
        .unwrap();

    let server_config = rustls::ServerConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(
        vec![server_cert.der().clone()],
        rustls::pki_types::PrivateKeyDer::try_from(server_key.serialize_der()).unwrap(),
    )
    .unwrap();

    Pki {
        ca_pem: ca_cert.pem(),
        server_config: Arc::new(server_config),
    }
}

// ── Wire helpers ─────────────────────────────────────────────────────

fn read_packet<S: Read>(stream: &mut S) -> std::io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok((header[3], payload))
}

fn write_packet<S: Write>(stream: &mut S, seq: u8, payload: &[u8]) -> std::io::Result<()> {
    let len = (payload.len() as u32).to_le_bytes();
    stream.write_all(&[len[0], len[1], len[2], seq])?;
    stream.write_all(payload)?;
    stream.flush()
}

/// HandshakeV10 offering `mysql_native_password`, like an RDS instance.
fn greeting(tls: bool) -> Vec<u8> {
    let mut capabilities = CLIENT_LONG_PASSWORD
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC;
    if tls {
        capabilities |= CLIENT_SSL;
    }
    let mut payload = vec![0x0a];
    payload.extend_from_slice(b"8.0.35\0");
    payload.extend_from_slice(&7u32.to_le_bytes());
    payload.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 0]);
    payload.extend_from_slice(&(capabilities as u16).to_le_bytes());
    payload.push(0x2d);
    payload.extend_from_slice(&0x0002u16.to_le_bytes());
    payload.extend_from_slice(&((capabilities >> 16) as u16).to_le_bytes());
    payload.push(21);
    payload.extend_from_slice(&[0; 10]);
    payload.extend_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 0]);
    payload.extend_from_slice(b"mysql_native_password\0");
    payload
}

fn auth_switch_request() -> Vec<u8> {
    let mut payload = vec![0xfe];
    payload.extend_from_slice(CLEAR_PASSWORD_PLUGIN);
    payload.extend_from_slice(&[21; 20]);
    payload.push(0);
    payload
}

// ── Logins ───────────────────────────────────────────────────────────

/// What the server learned from one login.
#[derive(Clone, Debug)]
pub struct Login {
    pub username: String,
    pub database: String,
    /// The clear-text password sent after the auth switch.
    pub password: String,
}

fn parse_response(payload: &[u8]) -> (String, String) {
    let rest = &payload[32..];
    let nul = |buf: &[u8]| buf.iter().position(|&b| b == 0).unwrap_or(buf.len());

    let user_end = nul(rest);
    let username = String::from_utf8_lossy(&rest[..user_end]).into_owned();
    let rest = &rest[user_end + 1..];

    let (auth_len, rest) = match rest[0] {
        0xfc => (u16::from_le_bytes([rest[1], rest[2]]) as usize, &rest[3..]),
        n => (n as usize, &rest[1..]),
    };
    let rest = &rest[auth_len..];
    let database = String::from_utf8_lossy(&rest[..nul(rest)]).into_owned();
    (username, database)
}

fn clear_password(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

// ── MockMysqlServer ──────────────────────────────────────────────────

pub struct MockMysqlServer {
    pub addr: SocketAddr,
    logins: Arc<Mutex<Vec<Login>>>,
}

impl MockMysqlServer {
    /// A server that upgrades to TLS with `server_config`.
    pub fn start(server_config: Arc<rustls::ServerConfig>) -> Self {
        Self::spawn(Some(server_config))
    }

    /// A server that never offers TLS.
    pub fn start_plaintext() -> Self {
        Self::spawn(None)
    }

    pub fn logins(&self) -> Vec<Login> {
        self.logins.lock().unwrap().clone()
    }

    fn spawn(server_config: Option<Arc<rustls::ServerConfig>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
        let addr = listener.local_addr().expect("local addr");
        let logins = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&logins);
        std::thread::spawn(move || {
            while let Ok((mut stream, _)) = listener.accept() {
                let config = server_config.clone();
                let recorded = Arc::clone(&recorded);
                std::thread::spawn(move || {
                    if write_packet(&mut stream, 0, &greeting(config.is_some())).is_err() {
                        return;
                    }
                    let Some(config) = config else {
                        // Clients that insist on TLS hang up here.
                        let _ = read_packet(&mut stream);
                        return;
                    };
                    let Ok((_, ssl_request)) = read_packet(&mut stream) else {
                        return;
                    };
                    if ssl_request.len() != 32 {
                        return;
                    }
                    let Ok(conn) = rustls::ServerConnection::new(config) else {
                        return;
                    };
                    let mut tls = rustls::StreamOwned::new(conn, stream);
                    serve_session(&mut tls, &recorded);
                });
            }
        });

        Self { addr, logins }
    }
}

fn serve_session<S: Read + Write>(stream: &mut S, logins: &Mutex<Vec<Login>>) {
    let Ok((seq, response)) = read_packet(stream) else {
        return;
    };
    let (username, database) = parse_response(&response);

    if write_packet(stream, seq + 1, &auth_switch_request()).is_err() {
        return;
    }
    let Ok((seq, switch_response)) = read_packet(stream) else {
        return;
    };
    logins.lock().unwrap().push(Login {
        username,
        database,
        password: clear_password(&switch_response),
    });
    if write_packet(stream, seq + 1, &OK_PAYLOAD).is_err() {
        return;
    }

    // COM_QUERY (session setup) and COM_PING both get a plain OK.
    while let Ok((_, command)) = read_packet(stream) {
        if command.first() == Some(&COM_QUIT) {
            break;
        }
        if write_packet(stream, 1, &OK_PAYLOAD).is_err() {
            break;
        }
    }
}
