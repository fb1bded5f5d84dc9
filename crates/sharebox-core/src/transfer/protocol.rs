//! 命令通道文本协议
//!
//! 每条消息是一个帧内的 ASCII 文本，字段以空白分隔：
//!
//! | 客户端 → 服务器 | 服务器 → 客户端 |
//! |---|---|
//! | `<clientName>`（首条） | `Welcome to the server!` / `ERROR: Name already in use.` |
//! | `LIST` | `<fileKey>: <owner>` 按行拼接，或 `No files available.` |
//! | `UPLOAD <filename> <size>` + 数据帧 | `Upload successful.` / `Upload successful, <filename> was overwritten` / `UPLOAD_FAILED` |
//! | `DOWNLOAD <owner> <fileKey>` | `OK <size>` + 数据帧，或 `ERROR: Download failed.` |
//! | `DELETE <owner> <fileKey>` | `File deleted successfully.` / 权限错误 / `ERROR: Deletion failed.` |
//! | `EXIT` | 关闭连接 |
//!
//! 心跳和通知连接建立后先发送一条 `CHANNEL LIVENESS <clientName>` /
//! `CHANNEL NOTIFICATION <clientName>`，服务器据此把它们与同名的命令连接配对。

use std::fmt;
use std::str::FromStr;

pub const WELCOME: &str = "Welcome to the server!";
pub const NAME_IN_USE: &str = "ERROR: Name already in use.";
pub const INVALID_NAME: &str = "ERROR: Invalid client name.";
pub const NO_FILES: &str = "No files available.";
pub const UPLOAD_OK: &str = "Upload successful.";
pub const UPLOAD_FAILED: &str = "UPLOAD_FAILED";
pub const DOWNLOAD_FAILED: &str = "ERROR: Download failed.";
pub const DELETE_OK: &str = "File deleted successfully.";
pub const DELETE_DENIED: &str = "ERROR: You do not have permission to delete this file.";
pub const DELETE_FAILED: &str = "ERROR: Deletion failed.";
pub const UNKNOWN_COMMAND: &str = "ERROR: Unknown command.";
pub const LIST_FAILED: &str = "ERROR: File list too large.";
pub const HEARTBEAT: &str = "HEARTBEAT";

/// 命令解析错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("malformed {verb} command: {reason}")]
    Malformed { verb: &'static str, reason: String },
}

impl ParseError {
    /// 该错误对应的失败响应
    pub fn failure_response(&self) -> &'static str {
        match self {
            ParseError::Malformed { verb: "UPLOAD", .. } => UPLOAD_FAILED,
            ParseError::Malformed { verb: "DOWNLOAD", .. } => DOWNLOAD_FAILED,
            ParseError::Malformed { verb: "DELETE", .. } => DELETE_FAILED,
            _ => UNKNOWN_COMMAND,
        }
    }
}

/// 客户端命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Upload { filename: String, size: u64 },
    Download { owner: String, file_key: String },
    Delete { owner: String, file_key: String },
    Exit,
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut parts = text.split_whitespace();
        let verb = parts.next().ok_or(ParseError::Empty)?;

        let command = match verb {
            "LIST" => Command::List,
            "EXIT" => Command::Exit,
            "UPLOAD" => {
                let (filename, size) = two_fields("UPLOAD", &mut parts)?;
                let size = size.parse().map_err(|_| ParseError::Malformed {
                    verb: "UPLOAD",
                    reason: format!("invalid size '{size}'"),
                })?;
                Command::Upload { filename, size }
            }
            "DOWNLOAD" => {
                let (owner, file_key) = two_fields("DOWNLOAD", &mut parts)?;
                Command::Download { owner, file_key }
            }
            "DELETE" => {
                let (owner, file_key) = two_fields("DELETE", &mut parts)?;
                Command::Delete { owner, file_key }
            }
            other => return Err(ParseError::Unknown(other.to_string())),
        };

        if let Some(extra) = parts.next() {
            return Err(match command {
                Command::Upload { .. } => malformed("UPLOAD", extra),
                Command::Download { .. } => malformed("DOWNLOAD", extra),
                Command::Delete { .. } => malformed("DELETE", extra),
                Command::List | Command::Exit => ParseError::Unknown(text.trim().to_string()),
            });
        }

        Ok(command)
    }
}

fn two_fields<'a>(
    verb: &'static str,
    parts: &mut impl Iterator<Item = &'a str>,
) -> Result<(String, String), ParseError> {
    match (parts.next(), parts.next()) {
        (Some(a), Some(b)) => Ok((a.to_string(), b.to_string())),
        _ => Err(ParseError::Malformed {
            verb,
            reason: "expected two arguments".to_string(),
        }),
    }
}

fn malformed(verb: &'static str, extra: &str) -> ParseError {
    ParseError::Malformed {
        verb,
        reason: format!("unexpected argument '{extra}'"),
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::List => write!(f, "LIST"),
            Command::Exit => write!(f, "EXIT"),
            Command::Upload { filename, size } => write!(f, "UPLOAD {filename} {size}"),
            Command::Download { owner, file_key } => write!(f, "DOWNLOAD {owner} {file_key}"),
            Command::Delete { owner, file_key } => write!(f, "DELETE {owner} {file_key}"),
        }
    }
}

/// 由所有者和原始文件名生成文件键
pub fn file_key(owner: &str, filename: &str) -> String {
    format!("{owner}_{filename}")
}

/// 名称会成为文件键的前缀，因此必须是单个普通路径分量：
/// 非空，不含空白、`/`、`\\`、NUL，且不以 `.` 开头
pub fn is_valid_client_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && !name.chars().any(char::is_whitespace)
}

const CHANNEL_HELLO: &str = "CHANNEL";

/// 辅助连接的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Liveness,
    Notification,
}

impl ChannelRole {
    fn as_str(self) -> &'static str {
        match self {
            ChannelRole::Liveness => "LIVENESS",
            ChannelRole::Notification => "NOTIFICATION",
        }
    }
}

/// 辅助连接的首条消息
pub fn channel_hello(role: ChannelRole, name: &str) -> String {
    format!("{CHANNEL_HELLO} {} {name}", role.as_str())
}

/// 解析 `CHANNEL <ROLE> <clientName>`，不是辅助连接的首条消息时返回 `None`
pub fn parse_channel_hello(text: &str) -> Option<(ChannelRole, &str)> {
    let rest = text.strip_prefix(CHANNEL_HELLO)?.strip_prefix(' ')?;
    let (role, name) = rest.split_once(' ')?;
    let role = match role {
        "LIVENESS" => ChannelRole::Liveness,
        "NOTIFICATION" => ChannelRole::Notification,
        _ => return None,
    };
    Some((role, name))
}

pub fn upload_overwritten(filename: &str) -> String {
    format!("Upload successful, {filename} was overwritten")
}

pub fn download_ready(size: u64) -> String {
    format!("OK {size}")
}

/// 解析 `OK <size>`
pub fn parse_download_ready(text: &str) -> Option<u64> {
    let size = text.strip_prefix("OK ")?;
    size.trim().parse().ok()
}

pub fn download_notice(file_key: &str, downloader: &str) -> String {
    format!("NOTICE: Your file '{file_key}' has been downloaded by {downloader}.")
}

/// 是否为失败响应
pub fn is_error_response(text: &str) -> bool {
    text.contains("ERROR") || text == UPLOAD_FAILED
}

/// 编码 LIST 响应
pub fn format_file_list<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let records: Vec<String> = entries
        .into_iter()
        .map(|(key, owner)| format!("{key}: {owner}"))
        .collect();

    if records.is_empty() {
        NO_FILES.to_string()
    } else {
        records.join("\n")
    }
}

/// 远端文件记录（LIST 中的一行）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteFile {
    pub file_key: String,
    pub owner: String,
}

impl fmt::Display for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.file_key, self.owner)
    }
}

/// 解析 LIST 响应，格式不对的行会被跳过
pub fn parse_file_list(text: &str) -> Vec<RemoteFile> {
    let text = text.trim();
    if text.is_empty() || text == NO_FILES {
        return Vec::new();
    }

    text.lines()
        .filter_map(|line| {
            let (key, owner) = line.split_once(": ")?;
            let (key, owner) = (key.trim(), owner.trim());
            if key.is_empty() || owner.is_empty() {
                log::warn!("Skipping malformed file record: {}", line);
                return None;
            }
            Some(RemoteFile {
                file_key: key.to_string(),
                owner: owner.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!("LIST".parse::<Command>().unwrap(), Command::List);
        assert_eq!("EXIT".parse::<Command>().unwrap(), Command::Exit);
        assert_eq!(
            "UPLOAD notes.txt 1024".parse::<Command>().unwrap(),
            Command::Upload {
                filename: "notes.txt".to_string(),
                size: 1024
            }
        );
        assert_eq!(
            "DELETE alice alice_notes.txt".parse::<Command>().unwrap(),
            Command::Delete {
                owner: "alice".to_string(),
                file_key: "alice_notes.txt".to_string()
            }
        );
    }

    #[test]
    fn test_display_matches_wire_format() {
        let cmd = Command::Download {
            owner: "bob".to_string(),
            file_key: "bob_a.bin".to_string(),
        };
        assert_eq!(cmd.to_string(), "DOWNLOAD bob bob_a.bin");
        assert_eq!(cmd.to_string().parse::<Command>().unwrap(), cmd);
    }

    #[test]
    fn test_malformed_commands_map_to_failure_tokens() {
        let err = "UPLOAD notes.txt lots".parse::<Command>().unwrap_err();
        assert_eq!(err.failure_response(), UPLOAD_FAILED);

        let err = "DOWNLOAD bob".parse::<Command>().unwrap_err();
        assert_eq!(err.failure_response(), DOWNLOAD_FAILED);

        let err = "DELETE a b c".parse::<Command>().unwrap_err();
        assert_eq!(err.failure_response(), DELETE_FAILED);

        assert_eq!("".parse::<Command>().unwrap_err(), ParseError::Empty);
        let err = "FETCH x".parse::<Command>().unwrap_err();
        assert_eq!(err.failure_response(), UNKNOWN_COMMAND);
    }

    #[test]
    fn test_file_list_format_and_parse() {
        assert_eq!(format_file_list(std::iter::empty()), NO_FILES);
        assert!(parse_file_list(NO_FILES).is_empty());

        let text = format_file_list([("alice_a.txt", "alice"), ("bob_b.txt", "bob")]);
        assert_eq!(text, "alice_a.txt: alice\nbob_b.txt: bob");

        let files = parse_file_list(&text);
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].file_key, "bob_b.txt");
        assert_eq!(files[1].owner, "bob");
    }

    #[test]
    fn test_parse_file_list_skips_garbage() {
        let files = parse_file_list("alice_a.txt: alice\ngarbage\n: nobody");
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_download_ready() {
        assert_eq!(parse_download_ready(&download_ready(42)), Some(42));
        assert_eq!(parse_download_ready(DOWNLOAD_FAILED), None);
        assert_eq!(parse_download_ready("OK nope"), None);
    }

    #[test]
    fn test_client_names() {
        assert!(is_valid_client_name("alice"));
        assert!(!is_valid_client_name(""));
        assert!(!is_valid_client_name("alice smith"));
        assert!(!is_valid_client_name("../evil"));
        assert!(!is_valid_client_name("a/b"));
        assert!(!is_valid_client_name("a\\b"));
        assert!(!is_valid_client_name("nul\0"));
        assert!(!is_valid_client_name(".hidden"));
        assert!(is_valid_client_name("bob.v2"));
    }

    #[test]
    fn test_channel_hello() {
        let hello = channel_hello(ChannelRole::Notification, "alice");
        assert_eq!(hello, "CHANNEL NOTIFICATION alice");
        assert_eq!(
            parse_channel_hello(&hello),
            Some((ChannelRole::Notification, "alice"))
        );
        assert_eq!(
            parse_channel_hello("CHANNEL LIVENESS bob"),
            Some((ChannelRole::Liveness, "bob"))
        );
        assert_eq!(parse_channel_hello("CHANNEL COMMAND bob"), None);
        assert_eq!(parse_channel_hello("CHANNELS"), None);
        assert_eq!(parse_channel_hello("alice"), None);
    }

    #[test]
    fn test_error_responses() {
        assert!(is_error_response(NAME_IN_USE));
        assert!(is_error_response(UPLOAD_FAILED));
        assert!(is_error_response(LIST_FAILED));
        assert!(!is_error_response(WELCOME));
        assert!(!is_error_response(&upload_overwritten("a.txt")));
    }
}
