use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa};
use rustls::{Certificate, PrivateKey};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
};
use tokio_rustls::TlsAcceptor;
use trust_dns_proto::{
    op::{Message, MessageType, OpCode, ResponseCode},
    rr::{
        rdata::tlsa::{CertUsage, Matching, Selector, TLSA},
        Name, RData, Record,
    },
};

use crate::{resolver::Resolver, server::Server};


pub const LEAF_NAME: &str = "www.example.test";

/// A root -> intermediate -> leaf chain for the tests, generated fresh
/// per call; hashes must always be computed from the same instance.
pub struct TestChain {
    pub root_der: Vec<u8>,
    pub inter_der: Vec<u8>,
    pub leaf_der: Vec<u8>,
    pub leaf_key_der: Vec<u8>,
}

impl TestChain {
    pub fn generate(leaf_name: &str) -> Self {
        let mut root_params = CertificateParams::new(Vec::<String>::new());
        root_params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        root_params
            .distinguished_name
            .push(DnType::CommonName, "dane-tls test root");
        let root = rcgen::Certificate::from_params(root_params).unwrap();

        let mut inter_params = CertificateParams::new(Vec::<String>::new());
        inter_params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        inter_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        inter_params
            .distinguished_name
            .push(DnType::CommonName, "dane-tls test intermediate");
        let inter = rcgen::Certificate::from_params(inter_params).unwrap();

        let mut leaf_params = CertificateParams::new(vec![leaf_name.to_string()]);
        leaf_params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, leaf_name);
        let leaf = rcgen::Certificate::from_params(leaf_params).unwrap();

        TestChain {
            root_der: root.serialize_der().unwrap(),
            inter_der: inter.serialize_der_with_signer(&root).unwrap(),
            leaf_der: leaf.serialize_der_with_signer(&inter).unwrap(),
            leaf_key_der: leaf.serialize_private_key_der(),
        }
    }

    /// Leaf-first chain as sent by a server.
    pub fn chain(&self) -> Vec<Certificate> {
        vec![
            Certificate(self.leaf_der.clone()),
            Certificate(self.inter_der.clone()),
            Certificate(self.root_der.clone()),
        ]
    }

    /// Chain without the root, as most servers send it.
    pub fn chain_no_root(&self) -> Vec<Certificate> {
        vec![
            Certificate(self.leaf_der.clone()),
            Certificate(self.inter_der.clone()),
        ]
    }
}

pub type DnsHandler = Arc<dyn Fn(&Message, bool) -> Option<Message> + Send + Sync>;

/// Starts an in-process DNS server answering via `handler` on both UDP
/// and TCP, and returns a resolver pointed at it.
pub async fn spawn_mock_dns(handler: DnsHandler) -> Resolver {
    let udp = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = udp.local_addr().unwrap();
    let tcp = TcpListener::bind(addr).await.unwrap();

    let udp_handler = handler.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, peer)) = udp.recv_from(&mut buf).await else {
                break;
            };
            let Ok(request) = Message::from_vec(&buf[..len]) else {
                continue;
            };
            if let Some(response) = udp_handler(&request, false) {
                if let Ok(bytes) = response.to_vec() {
                    let _ = udp.send_to(&bytes, peer).await;
                }
            }
        }
    });

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = tcp.accept().await else {
                break;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut len_buf = [0u8; 2];
                if stream.read_exact(&mut len_buf).await.is_err() {
                    return;
                }
                let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                if stream.read_exact(&mut buf).await.is_err() {
                    return;
                }
                let Ok(request) = Message::from_vec(&buf) else {
                    return;
                };
                if let Some(response) = handler(&request, true) {
                    if let Ok(bytes) = response.to_vec() {
                        let _ = stream.write_all(&(bytes.len() as u16).to_be_bytes()).await;
                        let _ = stream.write_all(&bytes).await;
                    }
                }
            });
        }
    });

    let mut resolver =
        Resolver::new(vec![Server::new(String::new(), addr.ip(), addr.port()).unwrap()]);
    resolver.timeout = Duration::from_millis(500);
    resolver
}

pub fn dns_reply_full(
    request: &Message,
    answers: Vec<Record>,
    ad: bool,
    rcode: ResponseCode,
    tc: bool,
) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_authentic_data(ad)
        .set_truncated(tc)
        .set_response_code(rcode);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    for answer in answers {
        response.add_answer(answer);
    }
    response
}

pub fn dns_reply(request: &Message, answers: Vec<Record>, ad: bool) -> Message {
    dns_reply_full(request, answers, ad, ResponseCode::NoError, false)
}

pub fn tlsa_record(owner: &str, usage: u8, selector: u8, mtype: u8, data: Vec<u8>) -> Record {
    Record::from_rdata(
        Name::from_ascii(owner).unwrap(),
        300,
        RData::TLSA(TLSA::new(
            CertUsage::from(usage),
            Selector::from(selector),
            Matching::from(mtype),
            data,
        )),
    )
}

pub fn a_record(owner: &str, ip: Ipv4Addr) -> Record {
    Record::from_rdata(Name::from_ascii(owner).unwrap(), 300, RData::A(ip))
}

pub fn aaaa_record(owner: &str, ip: std::net::Ipv6Addr) -> Record {
    Record::from_rdata(Name::from_ascii(owner).unwrap(), 300, RData::AAAA(ip))
}

fn tls_acceptor(chain: Vec<Certificate>, key_der: Vec<u8>) -> TlsAcceptor {
    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(chain, PrivateKey(key_der))
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Starts a TLS listener serving `chain`, accepting handshakes until
/// the runtime shuts down.
pub async fn spawn_tls_server(chain: Vec<Certificate>, key_der: Vec<u8>) -> SocketAddr {
    let acceptor = tls_acceptor(chain, key_der);
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(mut tls) = acceptor.accept(stream).await {
                    let mut buf = [0u8; 1];
                    let _ =
                        tokio::time::timeout(Duration::from_secs(2), tls.read(&mut buf)).await;
                }
            });
        }
    });
    addr
}

async fn server_read_line(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let read = stream.read(&mut byte).await?;
        if read == 0 || byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&line).trim_end().to_string())
}

/// A scripted STARTTLS server: greets, answers the protocol's
/// capability probe, accepts the upgrade command, then runs TLS.
pub async fn spawn_starttls_server(
    proto: &'static str,
    chain: Vec<Certificate>,
    key_der: Vec<u8>,
) -> SocketAddr {
    let acceptor = tls_acceptor(chain, key_der);
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let script = async {
                    match proto {
                        "smtp" => {
                            stream
                                .write_all(b"220 mx.example.test ESMTP ready\r\n")
                                .await?;
                            server_read_line(&mut stream).await?; // EHLO
                            stream
                                .write_all(
                                    b"250-mx.example.test\r\n250-PIPELINING\r\n250 STARTTLS\r\n",
                                )
                                .await?;
                            server_read_line(&mut stream).await?; // STARTTLS
                            stream.write_all(b"220 2.0.0 ready to start TLS\r\n").await?;
                        }
                        "imap" => {
                            stream.write_all(b"* OK IMAP4rev1 ready\r\n").await?;
                            server_read_line(&mut stream).await?; // . CAPABILITY
                            stream
                                .write_all(
                                    b"* CAPABILITY IMAP4rev1 STARTTLS\r\n. OK done\r\n",
                                )
                                .await?;
                            server_read_line(&mut stream).await?; // . STARTTLS
                            stream.write_all(b". OK begin TLS\r\n").await?;
                        }
                        "pop3" => {
                            stream.write_all(b"+OK POP3 ready\r\n").await?;
                            server_read_line(&mut stream).await?; // STLS
                            stream.write_all(b"+OK begin TLS\r\n").await?;
                        }
                        _ => unreachable!("unknown STARTTLS test protocol"),
                    }
                    std::io::Result::Ok(stream)
                };
                if let Ok(stream) = script.await {
                    if let Ok(mut tls) = acceptor.accept(stream).await {
                        let mut buf = [0u8; 1];
                        let _ = tokio::time::timeout(Duration::from_secs(2), tls.read(&mut buf))
                            .await;
                    }
                }
            });
        }
    });
    addr
}
