//! DCC CTCP message parser and formatter.
//!
//! Parses the payload following `DCC ` in a CTCP message:
//!
//! ```text
//! CHAT chat <ip_decimal> <port>
//! SEND <filename> <ip_decimal> <port> [<size>] [<token>] [T]
//! RESUME <filename> <port> <position> [<token>]
//! ACCEPT <filename> <port> <position> [<token>]
//! ```
//!
//! Filenames may be double-quoted to carry spaces. The `Display` impl of
//! [`DccRequest`] writes exactly this grammar back out, always quoting the
//! filename, so anything we send parses to the request that produced it.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use super::address::{parse_wire_ip, u32_to_ip};
use super::error::ParseError;

/// Trailing SEND field some clients use to request turbo mode.
pub const TURBO_FLAG: &str = "T";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DccRequest {
    Chat(ChatRequest),
    Send(SendRequest),
    Resume(ResumeRequest),
    Accept(AcceptRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub ip_raw: u32,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub filename: String,
    pub ip_raw: u32,
    /// `0` asks the receiver to listen instead (reverse DCC).
    pub port: u16,
    /// `None` when the sender did not say (wire `-1` or absent).
    pub size: Option<u64>,
    pub token: Option<String>,
    pub turbo: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRequest {
    pub filename: String,
    pub port: u16,
    pub position: u64,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptRequest {
    pub filename: String,
    pub port: u16,
    pub position: u64,
    pub token: Option<String>,
}

impl ChatRequest {
    pub fn ip(&self) -> Ipv4Addr {
        u32_to_ip(self.ip_raw)
    }
}

impl SendRequest {
    pub fn ip(&self) -> Ipv4Addr {
        u32_to_ip(self.ip_raw)
    }

    pub fn is_reverse(&self) -> bool {
        self.port == 0
    }
}

impl DccRequest {
    /// Parse a CTCP DCC payload such as `SEND "a b.txt" 2130706433 5000 10`.
    pub fn parse(payload: &str) -> Result<Self, ParseError> {
        let payload = payload.trim();
        let (command, rest) = match payload.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim_start()),
            None => (payload, ""),
        };
        if command.is_empty() {
            return Err(ParseError::Empty);
        }

        match command.to_ascii_uppercase().as_str() {
            "CHAT" => parse_chat(rest).map(DccRequest::Chat),
            "SEND" => parse_send(rest).map(DccRequest::Send),
            "RESUME" => {
                let (filename, port, position, token) = parse_position("RESUME", rest)?;
                Ok(DccRequest::Resume(ResumeRequest {
                    filename,
                    port,
                    position,
                    token,
                }))
            }
            "ACCEPT" => {
                let (filename, port, position, token) = parse_position("ACCEPT", rest)?;
                Ok(DccRequest::Accept(AcceptRequest {
                    filename,
                    port,
                    position,
                    token,
                }))
            }
            _ => Err(ParseError::UnknownCommand(command.to_string())),
        }
    }

    pub fn command_name(&self) -> &'static str {
        match self {
            DccRequest::Chat(_) => "CHAT",
            DccRequest::Send(_) => "SEND",
            DccRequest::Resume(_) => "RESUME",
            DccRequest::Accept(_) => "ACCEPT",
        }
    }
}

impl FromStr for DccRequest {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DccRequest::parse(s)
    }
}

fn parse_chat(rest: &str) -> Result<ChatRequest, ParseError> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 3 {
        return Err(ParseError::MissingFields {
            command: "CHAT",
            expected: 3,
            got: fields.len(),
        });
    }
    // fields[0] is the protocol name ("chat"); nothing else is in use.
    Ok(ChatRequest {
        ip_raw: parse_ip_field(fields[1])?,
        port: parse_port(fields[2])?,
    })
}

fn parse_send(rest: &str) -> Result<SendRequest, ParseError> {
    let (filename, rest) = split_filename(rest)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 2 {
        return Err(ParseError::MissingFields {
            command: "SEND",
            expected: 3,
            got: fields.len() + 1,
        });
    }

    let ip_raw = parse_ip_field(fields[0])?;
    let port = parse_port(fields[1])?;

    // Optional tail: [size] [token] [T]. A bare "T" is never a size or token.
    let mut tail = fields[2..].iter().copied().peekable();
    let size = match tail.peek() {
        Some(&TURBO_FLAG) | None => None,
        Some(_) => tail.next().and_then(parse_size),
    };
    let token = match tail.peek() {
        Some(&TURBO_FLAG) | None => None,
        Some(_) => tail.next().map(str::to_string),
    };
    let turbo = tail.any(|f| f == TURBO_FLAG);

    Ok(SendRequest {
        filename,
        ip_raw,
        port,
        size,
        token,
        turbo,
    })
}

fn parse_position(
    command: &'static str,
    rest: &str,
) -> Result<(String, u16, u64, Option<String>), ParseError> {
    let (filename, rest) = split_filename(rest)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 2 {
        return Err(ParseError::MissingFields {
            command,
            expected: 3,
            got: fields.len() + 1,
        });
    }

    let port = parse_port(fields[0])?;
    let position = fields[1]
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidNumber {
            field: "position",
            value: fields[1].to_string(),
        })?;
    let token = fields.get(2).map(|t| t.to_string());
    Ok((filename, port, position, token))
}

/// Split the leading filename off `input`, honouring double quotes.
///
/// A quoted name runs to the first unescaped `"` that ends a token; `\"`
/// inside the quotes stands for a literal quote.
fn split_filename(input: &str) -> Result<(String, &str), ParseError> {
    let input = input.trim_start();
    if input.is_empty() {
        return Err(ParseError::MissingFields {
            command: "filename",
            expected: 1,
            got: 0,
        });
    }

    if let Some(body) = input.strip_prefix('"') {
        let mut escaped = false;
        for (i, c) in body.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' => escaped = true,
                '"' => {
                    let after = &body[i + 1..];
                    if after.is_empty() || after.starts_with(char::is_whitespace) {
                        let name = body[..i].replace("\\\"", "\"");
                        if name.is_empty() {
                            return Err(ParseError::EmptyFilename);
                        }
                        return Ok((name, after));
                    }
                }
                _ => {}
            }
        }
        return Err(ParseError::UnterminatedQuote);
    }

    match input.split_once(char::is_whitespace) {
        Some((name, rest)) => Ok((name.to_string(), rest)),
        None => Ok((input.to_string(), "")),
    }
}

fn parse_port(raw: &str) -> Result<u16, ParseError> {
    raw.parse::<u16>()
        .map_err(|_| ParseError::InvalidPort(raw.to_string()))
}

fn parse_ip_field(raw: &str) -> Result<u32, ParseError> {
    parse_wire_ip(raw).map(u32::from).map_err(|_| ParseError::InvalidNumber {
        field: "address",
        value: raw.to_string(),
    })
}

fn parse_size(raw: &str) -> Option<u64> {
    raw.parse::<i64>()
        .ok()
        .and_then(|n| u64::try_from(n).ok())
}

fn quote(filename: &str) -> String {
    format!("\"{}\"", filename.replace('"', "\\\""))
}

impl fmt::Display for DccRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DccRequest::Chat(req) => write!(f, "CHAT chat {} {}", req.ip_raw, req.port),
            DccRequest::Send(req) => {
                write!(f, "SEND {} {} {}", quote(&req.filename), req.ip_raw, req.port)?;
                match req.size {
                    Some(size) => write!(f, " {}", size)?,
                    None if req.token.is_some() => f.write_str(" -1")?,
                    None => {}
                }
                if let Some(token) = &req.token {
                    write!(f, " {}", token)?;
                }
                if req.turbo {
                    write!(f, " {}", TURBO_FLAG)?;
                }
                Ok(())
            }
            DccRequest::Resume(req) => {
                write!(f, "RESUME {} {} {}", quote(&req.filename), req.port, req.position)?;
                if let Some(token) = &req.token {
                    write!(f, " {}", token)?;
                }
                Ok(())
            }
            DccRequest::Accept(req) => {
                write!(f, "ACCEPT {} {} {}", quote(&req.filename), req.port, req.position)?;
                if let Some(token) = &req.token {
                    write!(f, " {}", token)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(payload: &str) -> SendRequest {
        match DccRequest::parse(payload).unwrap() {
            DccRequest::Send(req) => req,
            other => panic!("expected SEND, got {:?}", other),
        }
    }

    #[test]
    fn test_classic_send() {
        let req = send("SEND \"report.txt\" 2130706433 5000 1024");
        assert_eq!(req.filename, "report.txt");
        assert_eq!(req.ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(req.port, 5000);
        assert_eq!(req.size, Some(1024));
        assert_eq!(req.token, None);
        assert!(!req.turbo);
        assert!(!req.is_reverse());
    }

    #[test]
    fn test_quoted_filename_with_spaces() {
        let req = send("SEND \"my report.txt\" 2130706433 5000 1024");
        assert_eq!(req.filename, "my report.txt");
        assert_eq!(req.port, 5000);

        let req = send("SEND \"two  spaces  here.bin\" 1 2 3");
        assert_eq!(req.filename, "two  spaces  here.bin");
    }

    #[test]
    fn test_quote_inside_filename() {
        let req = send("SEND \"say \\\"hi\\\".txt\" 1 2 3");
        assert_eq!(req.filename, "say \"hi\".txt");

        // A quote that does not end a token does not end the name.
        let req = send("SEND \"a\"b c\" 1 2 3");
        assert_eq!(req.filename, "a\"b c");
    }

    #[test]
    fn test_unquoted_filename() {
        let req = send("send file.txt 3232235521 5000");
        assert_eq!(req.filename, "file.txt");
        assert_eq!(req.size, None);
    }

    #[test]
    fn test_port_out_of_range() {
        assert_eq!(
            DccRequest::parse("SEND file.txt 123456 99999 10"),
            Err(ParseError::InvalidPort("99999".into()))
        );
        assert_eq!(
            DccRequest::parse("SEND file.txt 123456 -1 10"),
            Err(ParseError::InvalidPort("-1".into()))
        );
        assert!(DccRequest::parse("SEND file.txt 123456 abc 10").is_err());
    }

    #[test]
    fn test_non_numeric_fields() {
        assert!(matches!(
            DccRequest::parse("SEND file.txt localhost 5000"),
            Err(ParseError::InvalidNumber { field: "address", .. })
        ));
        assert!(matches!(
            DccRequest::parse("RESUME file.txt 5000 lots"),
            Err(ParseError::InvalidNumber { field: "position", .. })
        ));
    }

    #[test]
    fn test_missing_fields() {
        assert!(matches!(
            DccRequest::parse("SEND file.txt 2130706433"),
            Err(ParseError::MissingFields { command: "SEND", .. })
        ));
        assert!(matches!(
            DccRequest::parse("CHAT chat 2130706433"),
            Err(ParseError::MissingFields { command: "CHAT", .. })
        ));
        assert!(matches!(
            DccRequest::parse("ACCEPT file.txt 5000"),
            Err(ParseError::MissingFields { command: "ACCEPT", .. })
        ));
        assert!(DccRequest::parse("SEND").is_err());
        assert_eq!(DccRequest::parse("   "), Err(ParseError::Empty));
    }

    #[test]
    fn test_unterminated_and_empty_quotes() {
        assert_eq!(
            DccRequest::parse("SEND \"never closed 1 2 3"),
            Err(ParseError::UnterminatedQuote)
        );
        assert_eq!(
            DccRequest::parse("SEND \"\" 1 2 3"),
            Err(ParseError::EmptyFilename)
        );
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            DccRequest::parse("XMIT file 1 2"),
            Err(ParseError::UnknownCommand("XMIT".into()))
        );
    }

    #[test]
    fn test_reverse_send_with_token() {
        let req = send("SEND \"a.bin\" 2130706433 0 2048 tok42");
        assert!(req.is_reverse());
        assert_eq!(req.size, Some(2048));
        assert_eq!(req.token.as_deref(), Some("tok42"));
        assert!(!req.turbo);
    }

    #[test]
    fn test_turbo_flag_is_not_a_token() {
        let req = send("SEND a.bin 2130706433 5000 2048 T");
        assert_eq!(req.token, None);
        assert!(req.turbo);

        let req = send("SEND a.bin 2130706433 0 2048 99 T");
        assert_eq!(req.token.as_deref(), Some("99"));
        assert!(req.turbo);

        let req = send("SEND a.bin 2130706433 5000 T");
        assert_eq!(req.size, None);
        assert_eq!(req.token, None);
        assert!(req.turbo);
    }

    #[test]
    fn test_unknown_size() {
        assert_eq!(send("SEND a 1 2 -1").size, None);
        assert_eq!(send("SEND a 1 2 huge").size, None);
        let req = send("SEND a 1 0 -1 tok");
        assert_eq!(req.size, None);
        assert_eq!(req.token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_chat() {
        let req = DccRequest::parse("CHAT chat 2130706433 4000").unwrap();
        assert_eq!(
            req,
            DccRequest::Chat(ChatRequest {
                ip_raw: 2130706433,
                port: 4000
            })
        );
        assert_eq!(req.to_string(), "CHAT chat 2130706433 4000");
    }

    #[test]
    fn test_resume_and_accept() {
        let req = DccRequest::parse("RESUME \"my file.txt\" 5000 4096").unwrap();
        assert_eq!(
            req,
            DccRequest::Resume(ResumeRequest {
                filename: "my file.txt".into(),
                port: 5000,
                position: 4096,
                token: None,
            })
        );

        let req = DccRequest::parse("ACCEPT file.txt 0 4096 tok7").unwrap();
        assert_eq!(
            req,
            DccRequest::Accept(AcceptRequest {
                filename: "file.txt".into(),
                port: 0,
                position: 4096,
                token: Some("tok7".into()),
            })
        );
    }

    #[test]
    fn test_format_matches_wire() {
        let req = DccRequest::Send(SendRequest {
            filename: "a.bin".into(),
            ip_raw: 2130706433,
            port: 40123,
            size: Some(2048),
            token: Some("tok42".into()),
            turbo: false,
        });
        assert_eq!(req.to_string(), "SEND \"a.bin\" 2130706433 40123 2048 tok42");

        let req = DccRequest::Send(SendRequest {
            filename: "x".into(),
            ip_raw: 1,
            port: 0,
            size: None,
            token: Some("t1".into()),
            turbo: true,
        });
        assert_eq!(req.to_string(), "SEND \"x\" 1 0 -1 t1 T");
    }

    #[test]
    fn test_round_trip() {
        let requests = vec![
            DccRequest::Send(SendRequest {
                filename: "my report.txt".into(),
                ip_raw: 3232235521,
                port: 5000,
                size: Some(102400),
                token: Some("tok1".into()),
                turbo: false,
            }),
            DccRequest::Send(SendRequest {
                filename: "plain".into(),
                ip_raw: 0,
                port: 65535,
                size: None,
                token: None,
                turbo: false,
            }),
            DccRequest::Send(SendRequest {
                filename: "quote \"inside\"".into(),
                ip_raw: u32::MAX,
                port: 0,
                size: None,
                token: None,
                turbo: true,
            }),
            DccRequest::Send(SendRequest {
                filename: "unknown.iso".into(),
                ip_raw: 42,
                port: 0,
                size: None,
                token: Some("123".into()),
                turbo: true,
            }),
            DccRequest::Resume(ResumeRequest {
                filename: "a b c".into(),
                port: 0,
                position: 1 << 40,
                token: Some("tok".into()),
            }),
            DccRequest::Accept(AcceptRequest {
                filename: "file.txt".into(),
                port: 5000,
                position: 0,
                token: None,
            }),
            DccRequest::Chat(ChatRequest {
                ip_raw: 2130706433,
                port: 1,
            }),
        ];

        for req in requests {
            let text = req.to_string();
            assert_eq!(DccRequest::parse(&text), Ok(req), "payload: {}", text);
        }
    }
}
