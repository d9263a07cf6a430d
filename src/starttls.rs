use std::time::Duration;

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};

use crate::{
    config::{AppProtocol, Config},
    error::Error,
};

pub const STARTTLS_TIMEOUT: Duration = Duration::from_secs(4);

const XMPP_BUFSIZE: usize = 2048;

fn fail(proto: AppProtocol, phase: impl Into<String>) -> Error {
    Error::StartTls {
        proto,
        phase: phase.into(),
    }
}

/// Runs the application-protocol preamble that upgrades a cleartext
/// connection to TLS, leaving the socket positioned immediately after
/// the server's "proceed" reply. Every line exchanged is appended to
/// `config.transcript` prefixed `send:` / `recv:`.
pub(crate) async fn negotiate(stream: &mut TcpStream, config: &mut Config) -> Result<(), Error> {
    let Some(app) = config.app else {
        return Err(Error::Connect(
            "no STARTTLS application configured".to_string(),
        ));
    };
    let service = config
        .service_name
        .clone()
        .unwrap_or_else(|| config.server.name.clone());
    let mut transcript = std::mem::take(&mut config.transcript);

    let result = {
        let (read_half, mut write_half) = stream.split();
        let mut reader = BufReader::new(read_half);
        let dance = async {
            match app {
                AppProtocol::Smtp => smtp(&mut reader, &mut write_half, &mut transcript).await,
                AppProtocol::Imap => imap(&mut reader, &mut write_half, &mut transcript).await,
                AppProtocol::Pop3 => pop3(&mut reader, &mut write_half, &mut transcript).await,
                AppProtocol::XmppClient | AppProtocol::XmppServer => {
                    xmpp(&mut reader, &mut write_half, &mut transcript, app, &service).await
                }
            }
        };
        match timeout(STARTTLS_TIMEOUT, dance).await {
            Ok(result) => result,
            Err(_) => Err(fail(app, "timeout")),
        }
    };

    config.transcript = transcript;
    result
}

async fn send_raw<W: AsyncWrite + Unpin>(
    writer: &mut W,
    transcript: &mut String,
    proto: AppProtocol,
    phase: &str,
    data: &str,
) -> Result<(), Error> {
    writer
        .write_all(data.as_bytes())
        .await
        .map_err(|err| fail(proto, format!("{phase}: {err}")))?;
    writer
        .flush()
        .await
        .map_err(|err| fail(proto, format!("{phase}: {err}")))?;
    transcript.push_str("send: ");
    transcript.push_str(data);
    transcript.push('\n');
    Ok(())
}

async fn send_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    transcript: &mut String,
    proto: AppProtocol,
    phase: &str,
    line: &str,
) -> Result<(), Error> {
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|err| fail(proto, format!("{phase}: {err}")))?;
    writer
        .write_all(b"\r\n")
        .await
        .map_err(|err| fail(proto, format!("{phase}: {err}")))?;
    writer
        .flush()
        .await
        .map_err(|err| fail(proto, format!("{phase}: {err}")))?;
    transcript.push_str("send: ");
    transcript.push_str(line);
    transcript.push('\n');
    Ok(())
}

async fn recv_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    transcript: &mut String,
    proto: AppProtocol,
    phase: &str,
) -> Result<String, Error> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .await
        .map_err(|err| fail(proto, format!("{phase}: {err}")))?;
    if read == 0 {
        return Err(fail(proto, format!("{phase}: connection closed")));
    }
    let line = line
        .trim_end_matches(|c| c == '\r' || c == '\n')
        .to_string();
    transcript.push_str("recv: ");
    transcript.push_str(&line);
    transcript.push('\n');
    Ok(line)
}

async fn recv_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    transcript: &mut String,
    proto: AppProtocol,
    phase: &str,
) -> Result<String, Error> {
    let mut buf = vec![0u8; XMPP_BUFSIZE];
    let read = reader
        .read(&mut buf)
        .await
        .map_err(|err| fail(proto, format!("{phase}: {err}")))?;
    if read == 0 {
        return Err(fail(proto, format!("{phase}: connection closed")));
    }
    let chunk = String::from_utf8_lossy(&buf[..read]).to_string();
    transcript.push_str("recv: ");
    transcript.push_str(&chunk);
    transcript.push('\n');
    Ok(chunk)
}

// Reply code, text after the separator, and whether this line ends a
// possibly multi-line response.
fn parse_smtp_line(line: &str) -> Option<(u16, &str, bool)> {
    let code = line.get(..3)?.parse::<u16>().ok()?;
    let done = line.as_bytes().get(3) != Some(&b'-');
    let rest = line.get(4..).unwrap_or("");
    Some((code, rest, done))
}

async fn smtp<R, W>(reader: &mut R, writer: &mut W, transcript: &mut String) -> Result<(), Error>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    const PROTO: AppProtocol = AppProtocol::Smtp;

    // Possibly multi-line greeting
    let code = loop {
        let line = recv_line(reader, transcript, PROTO, "greeting").await?;
        let (code, _, done) = parse_smtp_line(&line)
            .ok_or_else(|| fail(PROTO, "greeting: malformed reply"))?;
        if done {
            break code;
        }
    };
    if code != 220 {
        return Err(fail(PROTO, "greeting: unexpected reply code"));
    }

    send_line(writer, transcript, PROTO, "capabilities", "EHLO localhost").await?;
    let mut got_starttls = false;
    loop {
        let line = recv_line(reader, transcript, PROTO, "capabilities").await?;
        let (code, rest, done) = parse_smtp_line(&line)
            .ok_or_else(|| fail(PROTO, "capabilities: malformed reply"))?;
        if code != 250 {
            return Err(fail(PROTO, "capabilities: unexpected reply code"));
        }
        if rest.contains("STARTTLS") {
            got_starttls = true;
        }
        if done {
            break;
        }
    }
    if !got_starttls {
        return Err(fail(PROTO, "capabilities: STARTTLS not advertised"));
    }

    send_line(writer, transcript, PROTO, "starttls", "STARTTLS").await?;
    let line = recv_line(reader, transcript, PROTO, "starttls").await?;
    let (code, _, _) =
        parse_smtp_line(&line).ok_or_else(|| fail(PROTO, "starttls: malformed reply"))?;
    if code != 220 {
        return Err(fail(PROTO, "starttls: unexpected reply code"));
    }
    Ok(())
}

async fn imap<R, W>(reader: &mut R, writer: &mut W, transcript: &mut String) -> Result<(), Error>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    const PROTO: AppProtocol = AppProtocol::Imap;

    let greeting = recv_line(reader, transcript, PROTO, "greeting").await?;
    if !greeting.starts_with("* OK") {
        return Err(fail(PROTO, "greeting: unexpected reply"));
    }

    send_line(writer, transcript, PROTO, "capabilities", ". CAPABILITY").await?;
    let mut got_starttls = false;
    loop {
        let line = recv_line(reader, transcript, PROTO, "capabilities").await?;
        if line.starts_with("* CAPABILITY") && line.contains("STARTTLS") {
            got_starttls = true;
        }
        if line.starts_with(". OK") {
            break;
        }
        if line.starts_with(". NO") || line.starts_with(". BAD") {
            return Err(fail(PROTO, "capabilities: unexpected reply"));
        }
    }
    if !got_starttls {
        return Err(fail(PROTO, "capabilities: STARTTLS not advertised"));
    }

    send_line(writer, transcript, PROTO, "starttls", ". STARTTLS").await?;
    let line = recv_line(reader, transcript, PROTO, "starttls").await?;
    if !line.starts_with(". OK") {
        return Err(fail(PROTO, "starttls: unexpected reply"));
    }
    Ok(())
}

async fn pop3<R, W>(reader: &mut R, writer: &mut W, transcript: &mut String) -> Result<(), Error>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    const PROTO: AppProtocol = AppProtocol::Pop3;

    let greeting = recv_line(reader, transcript, PROTO, "greeting").await?;
    if !greeting.starts_with("+OK") {
        return Err(fail(PROTO, "greeting: unexpected reply"));
    }

    send_line(writer, transcript, PROTO, "starttls", "STLS").await?;
    let line = recv_line(reader, transcript, PROTO, "starttls").await?;
    if !line.starts_with("+OK") {
        return Err(fail(PROTO, "starttls: unexpected reply"));
    }
    Ok(())
}

// RFC 6120, section 5.4.2
async fn xmpp<R, W>(
    reader: &mut R,
    writer: &mut W,
    transcript: &mut String,
    app: AppProtocol,
    service: &str,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let role = if app == AppProtocol::XmppServer {
        "server"
    } else {
        "client"
    };
    let header = format!(
        "<?xml version='1.0'?><stream:stream to='{service}' \
         version='1.0' xml:lang='en' xmlns='jabber:{role}' \
         xmlns:stream='http://etherx.jabber.org/streams'>"
    );
    send_raw(writer, transcript, app, "features", &header).await?;

    let features = recv_chunk(reader, transcript, app, "features").await?;
    if !features.contains("<starttls") || !features.contains("urn:ietf:params:xml:ns:xmpp-tls") {
        return Err(fail(app, "features: STARTTLS not offered"));
    }

    send_line(
        writer,
        transcript,
        app,
        "proceed",
        "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>",
    )
    .await?;
    let reply = recv_chunk(reader, transcript, app, "proceed").await?;
    if !reply.contains("<proceed") {
        return Err(fail(app, "proceed: unexpected reply"));
    }
    Ok(())
}
