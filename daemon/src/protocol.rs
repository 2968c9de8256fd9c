//! Control-plane line protocol.
//!
//! One UTF-8 command per line, one response line per command:
//!
//! | request           | response                                          |
//! |-------------------|---------------------------------------------------|
//! | `start <id>`      | `starting container <id> (image <ref> at <dir>)`  |
//! | `stop <id>`       | `stopping container <id>`                         |
//! | anything else     | `Received: <line>`                                |
//! | malformed / error | `error: <kind>: <message>`                        |

use std::fmt;
use std::path::PathBuf;

use cont_core::error::{ContError, Result};

/// A parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start { container_id: String },
    Stop { container_id: String },
    /// Any line that is not a lifecycle verb, kept verbatim
    Echo(String),
}

impl Command {
    /// Parse a request line (without its newline).
    ///
    /// `start` and `stop` take exactly one container id; any other token
    /// count is a malformed command. Lines that do not begin with a lifecycle
    /// verb are echoed.
    pub fn parse(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let verb = match tokens.first().copied() {
            Some(verb @ ("start" | "stop")) => verb,
            _ => return Ok(Command::Echo(line.to_string())),
        };

        if tokens.len() != 2 {
            return Err(ContError::MalformedCommand(format!(
                "'{}' expects exactly one container id, got {} argument(s)",
                verb,
                tokens.len() - 1
            )));
        }

        let container_id = tokens[1].to_string();
        Ok(match verb {
            "start" => Command::Start { container_id },
            _ => Command::Stop { container_id },
        })
    }
}

/// Image a `start` was served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedImage {
    pub reference: String,
    pub location: PathBuf,
}

/// A response line (without its newline).
#[derive(Debug)]
pub enum Response {
    Received(String),
    Starting {
        container_id: String,
        image: StartedImage,
    },
    Stopping {
        container_id: String,
    },
    Error(ContError),
}

impl From<ContError> for Response {
    fn from(err: ContError) -> Self {
        Response::Error(err)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Received(line) => write!(f, "Received: {}", line),
            Response::Starting {
                container_id,
                image,
            } => write!(
                f,
                "starting container {} (image {} at {})",
                container_id,
                image.reference,
                image.location.display()
            ),
            Response::Stopping { container_id } => {
                write!(f, "stopping container {}", container_id)
            }
            // Responses are single lines; error messages may carry newlines.
            Response::Error(err) => write!(
                f,
                "error: {}: {}",
                err.kind(),
                err.to_string().replace(['\r', '\n'], " ")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start() {
        assert_eq!(
            Command::parse("start mycontainer").unwrap(),
            Command::Start {
                container_id: "mycontainer".to_string()
            }
        );
    }

    #[test]
    fn test_parse_stop_with_extra_spaces() {
        assert_eq!(
            Command::parse("  stop   web-1 ").unwrap(),
            Command::Stop {
                container_id: "web-1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_malformed() {
        for line in ["start", "start foo bar", "stop", "stop a b c"] {
            let err = Command::parse(line).unwrap_err();
            assert!(matches!(err, ContError::MalformedCommand(_)), "{line}");
        }
    }

    #[test]
    fn test_parse_echo() {
        assert_eq!(
            Command::parse("hello world").unwrap(),
            Command::Echo("hello world".to_string())
        );
        assert_eq!(Command::parse("").unwrap(), Command::Echo(String::new()));
        // Verbs are case-sensitive
        assert_eq!(
            Command::parse("START x").unwrap(),
            Command::Echo("START x".to_string())
        );
        assert_eq!(
            Command::parse("starting x").unwrap(),
            Command::Echo("starting x".to_string())
        );
    }

    #[test]
    fn test_response_lines() {
        assert_eq!(Response::Received("hi".to_string()).to_string(), "Received: hi");
        assert_eq!(
            Response::Stopping {
                container_id: "c1".to_string()
            }
            .to_string(),
            "stopping container c1"
        );
        assert_eq!(
            Response::Starting {
                container_id: "c1".to_string(),
                image: StartedImage {
                    reference: "docker.io/library/nginx:latest".to_string(),
                    location: PathBuf::from("/var/lib/cont/oci-layout"),
                },
            }
            .to_string(),
            "starting container c1 (image docker.io/library/nginx:latest at /var/lib/cont/oci-layout)"
        );
    }

    #[test]
    fn test_error_response_is_single_line() {
        let resp = Response::from(ContError::FetchError {
            target: "sha256:abc".to_string(),
            message: "line one\nline two".to_string(),
        });
        let line = resp.to_string();
        assert!(line.starts_with("error: fetch: "));
        assert!(!line.contains('\n'));
    }
}
