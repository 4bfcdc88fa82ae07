//! 基于 TCP 的行式 CLI 会话
//!
//! 适用于 telnet 风格的设备管理口或终端服务器：
//! 读到 `Username:` / `Password:` 提示时应答凭据，
//! 登录阶段以 `#`、`>`、`]` 结尾的行识别提示符；登录成功后记下设备主机名，
//! 之后只有与该主机名吻合的提示符（含配置模式变体）才视为一次交互结束。
//! 输出按字节累积，读到提示符后整体解码。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let connector = TcpCliConnector::new(TcpCliConfig::default());
//! let mut session = connector.open(&target).await?;
//! let response = session.send_command("show version", Duration::from_secs(10)).await?;
//! ```

use crate::error::SessionError;
use crate::session::{CommandResponse, DeviceSession, SessionConnector};
use async_trait::async_trait;
use domain::{DeviceTarget, Platform};
use std::borrow::Cow;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

const AUTH_FAILURE_MARKERS: [&str; 5] = [
    "authentication failed",
    "login failed",
    "login invalid",
    "access denied",
    "bad password",
];

const COMMAND_ERROR_MARKERS: [&str; 6] = [
    "% invalid",
    "% incomplete",
    "% ambiguous",
    "% unknown",
    "error:",
    "unrecognized command",
];

/// TCP CLI 适配配置
#[derive(Debug, Clone)]
pub struct TcpCliConfig {
    /// 建立 TCP 连接的超时
    pub connect_timeout: Duration,
    /// 完成登录（含 enable）的超时
    pub login_timeout: Duration,
    /// 登录后关闭分页输出
    pub disable_paging: bool,
}

impl Default for TcpCliConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            login_timeout: Duration::from_secs(30),
            disable_paging: true,
        }
    }
}

/// 提示符类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prompt {
    Username,
    Password,
    /// 用户视图，如 `sw1>` / `<HUAWEI>`
    User,
    /// 特权/系统视图，如 `sw1#` / `[HUAWEI]`
    Privileged,
}

fn detect_prompt(buffer: &str) -> Option<Prompt> {
    let tail = buffer.rsplit('\n').next()?.trim_end();
    if tail.is_empty() {
        return None;
    }
    let lower = tail.to_ascii_lowercase();
    if lower.ends_with("username:") || lower.ends_with("login:") {
        Some(Prompt::Username)
    } else if lower.ends_with("password:") {
        Some(Prompt::Password)
    } else if tail.ends_with('#') || tail.ends_with(']') {
        Some(Prompt::Privileged)
    } else if tail.ends_with('>') {
        Some(Prompt::User)
    } else {
        None
    }
}

/// 登录后的设备提示符，按主机名匹配。
#[derive(Debug, Clone, PartialEq, Eq)]
struct DevicePrompt {
    host: String,
}

impl DevicePrompt {
    /// 从登录完成时的提示符行提取主机名：`sw1#`、`sw1>`、`<HUAWEI>`、`[HUAWEI]`。
    fn from_line(line: &str) -> Option<Self> {
        let line = line.trim();
        let host = if let Some(inner) = line.strip_prefix('<').and_then(|l| l.strip_suffix('>')) {
            inner
        } else if let Some(inner) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            inner.trim_start_matches(['~', '*'])
        } else if let Some(rest) = line.strip_suffix('#').or_else(|| line.strip_suffix('>')) {
            rest.split('(').next().unwrap_or(rest)
        } else {
            return None;
        };
        let host = host.trim();
        (!host.is_empty()).then(|| Self {
            host: host.to_string(),
        })
    }

    /// 行是否为本设备的提示符，允许 `sw1(config-if)#`、`[HUAWEI-GigabitEthernet0/0/1]` 等模式变体。
    fn matches(&self, line: &str) -> bool {
        let line = line.trim();
        let host = self.host.as_str();
        if let Some(inner) = line.strip_prefix('<').and_then(|l| l.strip_suffix('>')) {
            return inner == host;
        }
        if let Some(inner) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let inner = inner.trim_start_matches(['~', '*']);
            return inner
                .strip_prefix(host)
                .is_some_and(|mode| mode.is_empty() || mode.starts_with('-'));
        }
        if let Some(rest) = line.strip_suffix('#').or_else(|| line.strip_suffix('>')) {
            return rest
                .strip_prefix(host)
                .is_some_and(|mode| mode.is_empty() || (mode.starts_with('(') && mode.ends_with(')')));
        }
        false
    }
}

/// 缓冲区最后一行（可能是未完整的行）。
fn last_line(bytes: &[u8]) -> Cow<'_, str> {
    let start = bytes
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |index| index + 1);
    String::from_utf8_lossy(&bytes[start..])
}

fn contains_auth_failure(buffer: &str) -> bool {
    let lower = buffer.to_ascii_lowercase();
    AUTH_FAILURE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

fn contains_command_error(output: &str) -> bool {
    output.lines().any(|line| {
        let lower = line.trim_start().to_ascii_lowercase();
        COMMAND_ERROR_MARKERS
            .iter()
            .any(|marker| lower.starts_with(marker))
    })
}

/// 去掉命令回显与结尾提示符。
fn clean_output(raw: &str, command: &str, prompt: Option<&DevicePrompt>) -> String {
    let normalized = raw.replace('\r', "");
    let mut lines: Vec<&str> = normalized.lines().collect();
    if lines
        .first()
        .is_some_and(|first| first.trim() == command.trim())
    {
        lines.remove(0);
    }
    if lines
        .last()
        .is_some_and(|last| match prompt {
            Some(prompt) => prompt.matches(last),
            None => detect_prompt(last).is_some(),
        })
    {
        lines.pop();
    }
    lines.join("\n").trim_end().to_string()
}

fn paging_command(platform: Platform) -> Option<&'static str> {
    match platform {
        Platform::CiscoIos | Platform::CiscoNxos | Platform::CiscoIosXr => {
            Some("terminal length 0")
        }
        Platform::Huawei | Platform::H3c => Some("screen-length 0 temporary"),
        Platform::Unknown => None,
    }
}

fn config_mode_commands(platform: Platform) -> Option<(&'static str, &'static str)> {
    match platform {
        Platform::CiscoIos | Platform::CiscoNxos | Platform::CiscoIosXr => {
            Some(("configure terminal", "end"))
        }
        Platform::Huawei | Platform::H3c => Some(("system-view", "return")),
        Platform::Unknown => None,
    }
}

/// TCP CLI 会话打开器
#[derive(Debug, Clone, Default)]
pub struct TcpCliConnector {
    config: TcpCliConfig,
}

impl TcpCliConnector {
    pub fn new(config: TcpCliConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TcpCliConfig {
        &self.config
    }
}

#[async_trait]
impl SessionConnector for TcpCliConnector {
    async fn open(&self, target: &DeviceTarget) -> Result<Box<dyn DeviceSession>, SessionError> {
        let session = TcpCliSession::connect(target, &self.config).await?;
        Ok(Box::new(session))
    }
}

/// 已登录的 TCP CLI 会话
pub struct TcpCliSession {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    platform: Platform,
    /// 登录完成后确定。
    prompt: Option<DevicePrompt>,
    alive: bool,
}

impl TcpCliSession {
    /// 连接并完成登录。
    pub async fn connect(
        target: &DeviceTarget,
        config: &TcpCliConfig,
    ) -> Result<Self, SessionError> {
        let addr = format!("{}:{}", target.host, target.port);
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(SessionError::Connectivity(format!("{}: {}", addr, err)));
            }
            Err(_) => {
                return Err(SessionError::Connectivity(format!(
                    "{}: connect timed out after {}ms",
                    addr,
                    config.connect_timeout.as_millis()
                )));
            }
        };
        let (reader, writer) = stream.into_split();
        let mut session = Self {
            reader,
            writer,
            platform: target.platform,
            prompt: None,
            alive: true,
        };

        match tokio::time::timeout(config.login_timeout, session.login(target)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(SessionError::Connectivity(format!(
                    "{}: login timed out after {}ms",
                    addr,
                    config.login_timeout.as_millis()
                )));
            }
        }

        if config.disable_paging {
            if let Some(command) = paging_command(session.platform) {
                if let Err(err) = session.send_command(command, config.login_timeout).await {
                    warn!(
                        target: "netops.session",
                        host = %target.host,
                        error = %err,
                        "session_disable_paging_failed"
                    );
                }
            }
        }

        info!(
            target: "netops.session",
            host = %target.host,
            port = target.port,
            platform = %target.platform,
            "session_opened"
        );
        Ok(session)
    }

    async fn login(&mut self, target: &DeviceTarget) -> Result<(), SessionError> {
        let mut sent_password = false;
        loop {
            let buffer = match self.read_until_prompt(true).await {
                Ok(buffer) => buffer,
                Err(SessionError::Closed) => {
                    return Err(SessionError::Connectivity(
                        "connection closed during login".to_string(),
                    ));
                }
                Err(err) => return Err(err),
            };
            if contains_auth_failure(&buffer) {
                return Err(SessionError::Authentication(format!(
                    "device rejected credentials for {}",
                    target.username
                )));
            }
            match detect_prompt(&buffer) {
                Some(Prompt::Username) => {
                    if sent_password {
                        return Err(SessionError::Authentication(format!(
                            "login prompt repeated for {}",
                            target.username
                        )));
                    }
                    self.write_line(&target.username).await?;
                }
                Some(Prompt::Password) => {
                    if sent_password {
                        return Err(SessionError::Authentication(format!(
                            "password prompt repeated for {}",
                            target.username
                        )));
                    }
                    self.write_line(&target.password).await?;
                    sent_password = true;
                }
                Some(Prompt::User) => {
                    let buffer = self.enable(target).await?.unwrap_or(buffer);
                    return self.remember_prompt(&buffer);
                }
                Some(Prompt::Privileged) => return self.remember_prompt(&buffer),
                None => {
                    return Err(SessionError::Protocol(
                        "unexpected login banner".to_string(),
                    ));
                }
            }
        }
    }

    fn remember_prompt(&mut self, buffer: &str) -> Result<(), SessionError> {
        let line = buffer.rsplit('\n').next().unwrap_or(buffer);
        match DevicePrompt::from_line(line) {
            Some(prompt) => {
                self.prompt = Some(prompt);
                Ok(())
            }
            None => Err(SessionError::Protocol(format!(
                "cannot derive hostname from prompt `{}`",
                line.trim()
            ))),
        }
    }

    /// 用户视图下按需进入特权模式（仅 Cisco 且配置了 enable 密码），返回进入后的提示符缓冲。
    async fn enable(&mut self, target: &DeviceTarget) -> Result<Option<String>, SessionError> {
        let Some(secret) = target.enable_password.as_deref() else {
            return Ok(None);
        };
        if !self.platform.is_cisco() {
            return Ok(None);
        }
        self.write_line("enable").await?;
        let buffer = self.read_until_prompt(true).await?;
        if detect_prompt(&buffer) != Some(Prompt::Password) {
            return Err(SessionError::Protocol("enable did not ask for password".to_string()));
        }
        self.write_line(secret).await?;
        let buffer = self.read_until_prompt(true).await?;
        match detect_prompt(&buffer) {
            Some(Prompt::Privileged) => Ok(Some(buffer)),
            _ => Err(SessionError::Authentication(format!(
                "enable rejected for {}",
                target.username
            ))),
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), SessionError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_until_prompt(&mut self, during_login: bool) -> Result<String, SessionError> {
        let mut collected: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let read = self.reader.read(&mut chunk).await?;
            if read == 0 {
                self.alive = false;
                return Err(SessionError::Closed);
            }
            collected.extend_from_slice(&chunk[..read]);
            let tail = last_line(&collected);
            let done = match (&self.prompt, during_login) {
                (Some(prompt), false) => prompt.matches(&tail),
                _ => {
                    detect_prompt(&tail).is_some()
                        || (during_login
                            && contains_auth_failure(&String::from_utf8_lossy(&collected)))
                }
            };
            if done {
                return Ok(String::from_utf8_lossy(&collected).into_owned());
            }
        }
    }
}

#[async_trait]
impl DeviceSession for TcpCliSession {
    fn is_alive(&self) -> bool {
        self.alive
    }

    async fn send_command(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResponse, SessionError> {
        if !self.alive {
            return Err(SessionError::Closed);
        }
        let started = Instant::now();
        self.write_line(command).await?;
        let raw = match tokio::time::timeout(timeout, self.read_until_prompt(false)).await {
            Ok(result) => result?,
            Err(_) => {
                // 迟到的回显会污染下一条命令，直接作废会话。
                self.alive = false;
                return Err(SessionError::Timeout(format!(
                    "`{}` got no prompt within {}ms",
                    command,
                    timeout.as_millis()
                )));
            }
        };
        let output = clean_output(&raw, command, self.prompt.as_ref());
        let failed = contains_command_error(&output);
        debug!(
            target: "netops.session",
            command = %command,
            output_len = output.len(),
            failed,
            "session_command_completed"
        );
        Ok(CommandResponse {
            output,
            failed,
            elapsed: started.elapsed(),
        })
    }

    async fn send_config(
        &mut self,
        lines: &[String],
        timeout: Duration,
    ) -> Result<CommandResponse, SessionError> {
        let started = Instant::now();
        let mode = config_mode_commands(self.platform);
        if let Some((enter, _)) = mode {
            let response = self.send_command(enter, timeout).await?;
            if response.failed {
                return Ok(CommandResponse {
                    elapsed: started.elapsed(),
                    ..response
                });
            }
        }
        let mut output = Vec::with_capacity(lines.len());
        let mut failed = false;
        for line in lines {
            let response = self.send_command(line, timeout).await?;
            failed |= response.failed;
            if !response.output.is_empty() {
                output.push(response.output);
            }
        }
        if let Some((_, leave)) = mode {
            self.send_command(leave, timeout).await?;
        }
        Ok(CommandResponse {
            output: output.join("\n"),
            failed,
            elapsed: started.elapsed(),
        })
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if !self.alive {
            return Ok(());
        }
        self.alive = false;
        let _ = self.writer.write_all(b"exit\n").await;
        self.writer.shutdown().await?;
        debug!(target: "netops.session", "session_closed");
        Ok(())
    }
}
