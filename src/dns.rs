use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::timeout,
};
use trust_dns_proto::{
    op::{Edns, Message, MessageType, OpCode, Query as WireQuery, ResponseCode},
    rr::{DNSClass, Name, RData, RecordType},
};

use crate::{
    error::Error,
    resolver::Resolver,
    tlsa::{TlsaInfo, TlsaRecord},
};

/// Parameters of a single DNS question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub name: String,
    pub rtype: RecordType,
    pub class: DNSClass,
}

impl Query {
    /// Builds a query, absolutising the name with a trailing dot.
    pub fn new(qname: &str, rtype: RecordType, class: DNSClass) -> Self {
        let name = if qname.ends_with('.') {
            qname.to_string()
        } else {
            format!("{qname}.")
        };
        Query { name, rtype, class }
    }
}

fn make_query_message(query: &Query, resolver: &Resolver) -> Result<Message, Error> {
    let name = Name::from_ascii(&query.name)
        .map_err(|err| Error::Transport(format!("invalid query name {:?}: {err}", query.name)))?;
    let mut question = WireQuery::query(name, query.rtype);
    question.set_query_class(query.class);

    let mut message = Message::new();
    message
        .set_id(rand::random::<u16>())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(resolver.rd)
        .set_authentic_data(resolver.ad)
        .set_checking_disabled(resolver.cd)
        .add_query(question);

    // EDNS(0) with the DO bit: the upstream validator keeps signed data
    // available and reports validation through the AD flag.
    let mut edns = Edns::new();
    edns.set_max_payload(resolver.payload);
    edns.set_version(0);
    edns.set_dnssec_ok(true);
    message.set_edns(edns);

    Ok(message)
}

fn decode_response(buf: &[u8], expected_id: u16) -> Result<Message, Error> {
    if buf.is_empty() {
        return Err(Error::EmptyResponse);
    }
    let response = Message::from_vec(buf)
        .map_err(|err| Error::Transport(format!("malformed DNS response: {err}")))?;
    if response.id() != expected_id {
        return Err(Error::Transport("DNS response id mismatch".to_string()));
    }
    Ok(response)
}

async fn send_query_udp(query: &Query, resolver: &Resolver) -> Result<Message, Error> {
    let target = resolver.first_server()?.address();
    let message = make_query_message(query, resolver)?;
    let payload = message
        .to_vec()
        .map_err(|err| Error::Transport(format!("failed to encode DNS query: {err}")))?;

    let bind: SocketAddr = if target.is_ipv6() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|err| Error::Transport(err.to_string()))?;
    socket
        .connect(target)
        .await
        .map_err(|err| Error::Transport(err.to_string()))?;

    let mut attempts = resolver.retries.max(1);
    let mut buf = vec![0u8; resolver.payload.max(512) as usize];
    loop {
        socket
            .send(&payload)
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;

        match timeout(resolver.timeout, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => return decode_response(&buf[..len], message.id()),
            // Only timeouts are retried; any other transport error is final.
            Ok(Err(err)) => return Err(Error::Transport(err.to_string())),
            Err(_) => {
                attempts -= 1;
                if attempts == 0 {
                    return Err(Error::Transport(format!(
                        "query for {} timed out after {} attempts",
                        query.name,
                        resolver.retries.max(1)
                    )));
                }
                tracing::debug!(
                    module = "dns",
                    event = "retry",
                    qname = %query.name,
                    attempts_left = attempts,
                    "DNS query timed out, retrying."
                );
            }
        }
    }
}

async fn send_query_tcp(query: &Query, resolver: &Resolver) -> Result<Message, Error> {
    let target = resolver.first_server()?.address();
    let message = make_query_message(query, resolver)?;
    let payload = message
        .to_vec()
        .map_err(|err| Error::Transport(format!("failed to encode DNS query: {err}")))?;

    let exchange = async {
        let mut stream = TcpStream::connect(target).await?;
        stream.write_all(&(payload.len() as u16).to_be_bytes()).await?;
        stream.write_all(&payload).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut buf).await?;
        std::io::Result::Ok(buf)
    };

    match timeout(resolver.timeout, exchange).await {
        Ok(Ok(buf)) => decode_response(&buf, message.id()),
        Ok(Err(err)) => Err(Error::Transport(err.to_string())),
        Err(_) => Err(Error::Transport(format!(
            "TCP query for {} timed out",
            query.name
        ))),
    }
}

fn response_ok(response: &Message) -> bool {
    matches!(
        response.response_code(),
        ResponseCode::NoError | ResponseCode::NXDomain
    )
}

impl Resolver {
    /// Sends a single DNS query and returns the first usable response.
    ///
    /// UDP first, with retries on timeout; a truncated response is
    /// re-issued over TCP. Responses other than NOERROR or NXDOMAIN are
    /// rejected as [`Error::BadRcode`].
    pub async fn send_query(&self, query: &Query) -> Result<Message, Error> {
        let mut response = send_query_udp(query, self).await?;
        if response.truncated() {
            tracing::debug!(
                module = "dns",
                event = "tcp-fallback",
                qname = %query.name,
                "Response was truncated, retrying over TCP."
            );
            response = send_query_tcp(query, self).await?;
        }
        if !response_ok(&response) {
            return Err(Error::BadRcode(u16::from(response.response_code())));
        }
        Ok(response)
    }

    /// Resolves the IPv6 and IPv4 addresses of `hostname`, in that order.
    ///
    /// With `secure` set, responses that are not DNSSEC-authenticated
    /// (no AD flag) are rejected.
    pub async fn get_addresses(
        &self,
        hostname: &str,
        secure: bool,
    ) -> Result<Vec<IpAddr>, Error> {
        let mut rr_types = Vec::with_capacity(2);
        if self.want_ipv6 {
            rr_types.push(RecordType::AAAA);
        }
        if self.want_ipv4 {
            rr_types.push(RecordType::A);
        }

        let mut ip_list = Vec::new();
        for rtype in rr_types {
            let query = Query::new(hostname, rtype, DNSClass::IN);
            let response = self.send_query(&query).await?;
            if response.response_code() == ResponseCode::NXDomain {
                return Err(Error::NoSuchName(hostname.to_string()));
            }
            if secure && !response.authentic_data() {
                return Err(Error::UnauthenticatedAddress);
            }
            for record in response.answers() {
                match (rtype, record.data()) {
                    (RecordType::AAAA, Some(RData::AAAA(ip))) => ip_list.push(IpAddr::V6(*ip)),
                    (RecordType::A, Some(RData::A(ip))) => ip_list.push(IpAddr::V4(*ip)),
                    _ => (),
                }
            }
        }

        Ok(ip_list)
    }

    /// Looks up the TLSA RRset for `hostname`:`port`.
    ///
    /// Returns `Ok(None)` when no authenticated TLSA data is available
    /// and PKIX fallback is allowed; in strict mode the same conditions
    /// are errors.
    pub async fn get_tlsa(&self, hostname: &str, port: u16) -> Result<Option<TlsaInfo>, Error> {
        let query = Query::new(
            &format!("_{port}._tcp.{hostname}"),
            RecordType::TLSA,
            DNSClass::IN,
        );
        let response = self.send_query(&query).await?;

        if response.response_code() == ResponseCode::NXDomain {
            return Err(Error::NoSuchName(query.name.clone()));
        }
        if !response.authentic_data() {
            return if self.pkix_fallback {
                Ok(None)
            } else {
                Err(Error::UnauthenticatedTlsa)
            };
        }

        let qname = Name::from_ascii(&query.name)
            .map_err(|err| Error::Transport(format!("invalid query name: {err}")))?;
        let mut info = TlsaInfo::new(query.name.clone());
        for record in response.answers() {
            if let Some(RData::TLSA(tlsa)) = record.data() {
                if record.name() != &qname {
                    let owner = record.name().to_ascii();
                    if !info.alias.contains(&owner) {
                        info.alias.push(owner);
                    }
                }
                info.rdata.push(TlsaRecord::new(
                    u8::from(tlsa.cert_usage()),
                    u8::from(tlsa.selector()),
                    u8::from(tlsa.matching()),
                    hex::encode(tlsa.cert_data()),
                ));
            }
        }

        if info.rdata.is_empty() {
            return if self.pkix_fallback {
                Ok(None)
            } else {
                Err(Error::NoTlsaRecords)
            };
        }
        Ok(Some(info))
    }
}
