//! WinRM driver for Hyper-V hosts.
//!
//! A minimal WS-Man shell client: open a shell, run one PowerShell command,
//! poll Receive until the command completes, then tear the shell down.
//! Hosts are addressed by DNS hostname because WinRM does not accept IPv6
//! literals. Scripts are passed as `-EncodedCommand` so quoting survives
//! the SOAP round trip.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::debug;

use crate::{ExecError, ExecOutput, Remote, Result};

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";
const WSMAN_PORT: u16 = 5985;
const MAX_ENVELOPE_SIZE: u32 = 153600;
const OPERATION_TIMEOUT: &str = "PT60S";
const SHELL_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

pub struct WindowsWinRm {
    http: reqwest::Client,
    endpoint: String,
    host: String,
    username: String,
    password: String,
}

impl WindowsWinRm {
    /// Driver for the given host. `username` is the local administrator and
    /// `password` the shared network password.
    pub fn new(host: &str, username: &str, password: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("http://{host}:{WSMAN_PORT}/wsman"),
            host: host.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// Run a PowerShell script and collect its decoded output streams.
    pub async fn run_ps(&self, script: &str) -> Result<ExecOutput> {
        debug!(host = %self.host, "deploying powershell over winrm");
        let shell_id = self.open_shell().await?;
        let result = self.run_in_shell(&shell_id, script).await;
        // Best-effort teardown either way; the shell would otherwise linger
        // until the host reaps it.
        let _ = self.close_shell(&shell_id).await;
        result
    }

    async fn run_in_shell(&self, shell_id: &str, script: &str) -> Result<ExecOutput> {
        let encoded = encode_ps_command(script);
        let command_body = format!(
            r#"<rsp:CommandLine xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
  <rsp:Command>powershell</rsp:Command>
  <rsp:Arguments>-NoProfile -NonInteractive -EncodedCommand {encoded}</rsp:Arguments>
</rsp:CommandLine>"#
        );
        let response = self
            .post(ACTION_COMMAND, Some(shell_id), &command_body)
            .await?;
        let command_id = extract_element(&response, "CommandId")
            .ok_or_else(|| ExecError::WinRm("no CommandId in command response".to_string()))?;

        let mut output = ExecOutput::default();
        loop {
            let receive_body = format!(
                r#"<rsp:Receive xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
  <rsp:DesiredStream CommandId="{command_id}">stdout stderr</rsp:DesiredStream>
</rsp:Receive>"#
            );
            let response = self.post(ACTION_RECEIVE, Some(shell_id), &receive_body).await?;
            let chunk = parse_receive_response(&response)?;
            output.stdout.push_str(&chunk.stdout);
            output.stderr.push_str(&chunk.stderr);
            if chunk.done {
                break;
            }
        }

        let signal_body = format!(
            r#"<rsp:Signal xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell" CommandId="{command_id}">
  <rsp:Code>{SIGNAL_TERMINATE}</rsp:Code>
</rsp:Signal>"#
        );
        let _ = self.post(ACTION_SIGNAL, Some(shell_id), &signal_body).await;

        Ok(output)
    }

    async fn open_shell(&self) -> Result<String> {
        let body = r#"<rsp:Shell xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
  <rsp:InputStreams>stdin</rsp:InputStreams>
  <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>
</rsp:Shell>"#;
        let response = self.post(ACTION_CREATE, None, body).await?;
        extract_element(&response, "ShellId")
            .or_else(|| extract_selector(&response, "ShellId"))
            .ok_or_else(|| ExecError::WinRm("no ShellId in create response".to_string()))
    }

    async fn close_shell(&self, shell_id: &str) -> Result<()> {
        self.post(ACTION_DELETE, Some(shell_id), "").await.map(|_| ())
    }

    async fn post(&self, action: &str, shell_id: Option<&str>, body: &str) -> Result<String> {
        let message_id = message_id();
        let selector = shell_id
            .map(|id| {
                format!(
                    r#"<w:SelectorSet><w:Selector Name="ShellId">{id}</w:Selector></w:SelectorSet>"#
                )
            })
            .unwrap_or_default();
        let envelope = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope"
              xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing"
              xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd">
  <env:Header>
    <a:To>{endpoint}</a:To>
    <a:ReplyTo>
      <a:Address MustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
    </a:ReplyTo>
    <a:Action MustUnderstand="true">{action}</a:Action>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:ResourceURI MustUnderstand="true">{SHELL_URI}</w:ResourceURI>
    <w:MaxEnvelopeSize MustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>
    <w:OperationTimeout>{OPERATION_TIMEOUT}</w:OperationTimeout>
    {selector}
  </env:Header>
  <env:Body>
{body}
  </env:Body>
</env:Envelope>"#,
            endpoint = self.endpoint,
        );

        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .header("Content-Type", SOAP_CONTENT_TYPE)
            .body(envelope)
            .send()
            .await
            .map_err(|err| ExecError::WinRm(format!("request to {} failed: {err}", self.host)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ExecError::WinRm(format!("reading response from {}: {err}", self.host)))?;
        if !status.is_success() {
            return Err(ExecError::WinRm(format!(
                "{} answered HTTP {status}: {}",
                self.host,
                text.chars().take(512).collect::<String>()
            )));
        }
        Ok(text)
    }
}

impl Remote for WindowsWinRm {
    async fn exec_script(&self, script: &str) -> Result<ExecOutput> {
        self.run_ps(script).await
    }

    fn failure_class(&self) -> &'static str {
        "winrm_error"
    }
}

/// PowerShell `-EncodedCommand` takes base64 over UTF-16LE.
pub fn encode_ps_command(script: &str) -> String {
    let utf16: Vec<u8> = script
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    BASE64.encode(utf16)
}

fn message_id() -> String {
    let bits: u128 = rand::random();
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (bits >> 96) as u32,
        (bits >> 80) as u16,
        (bits >> 64) as u16,
        (bits >> 48) as u16,
        bits & 0xffff_ffff_ffff,
    )
}

struct ReceiveChunk {
    stdout: String,
    stderr: String,
    done: bool,
}

/// Pull the named element's text out of a response, ignoring namespace
/// prefixes.
fn extract_element(xml: &str, local_name: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                inside = local_matches(start.name().as_ref(), local_name);
            }
            Ok(Event::Text(text)) if inside => {
                return text.unescape().ok().map(|t| t.into_owned());
            }
            Ok(Event::End(_)) => inside = false,
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

/// Pull a `<w:Selector Name="...">` value out of a response.
fn extract_selector(xml: &str, selector_name: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) if local_matches(start.name().as_ref(), "Selector") => {
                inside = start.attributes().flatten().any(|attr| {
                    attr.key.as_ref().ends_with(b"Name")
                        && attr.value.as_ref() == selector_name.as_bytes()
                });
            }
            Ok(Event::Text(text)) if inside => {
                return text.unescape().ok().map(|t| t.into_owned());
            }
            Ok(Event::End(_)) => inside = false,
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

/// Decode the stdout/stderr stream chunks and the command state from a
/// Receive response.
fn parse_receive_response(xml: &str) -> Result<ReceiveChunk> {
    let mut reader = Reader::from_str(xml);
    let mut chunk = ReceiveChunk { stdout: String::new(), stderr: String::new(), done: false };
    // Which stream the current text belongs to
    let mut current: Option<&'static str> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) if local_matches(start.name().as_ref(), "Stream") => {
                current = None;
                for attr in start.attributes().flatten() {
                    if attr.key.as_ref().ends_with(b"Name") {
                        current = match attr.value.as_ref() {
                            b"stdout" => Some("stdout"),
                            b"stderr" => Some("stderr"),
                            _ => None,
                        };
                    }
                }
            }
            Ok(Event::Start(start)) | Ok(Event::Empty(start))
                if local_matches(start.name().as_ref(), "CommandState") =>
            {
                for attr in start.attributes().flatten() {
                    if attr.key.as_ref().ends_with(b"State")
                        && attr.value.as_ref().ends_with(b"CommandState/Done")
                    {
                        chunk.done = true;
                    }
                }
            }
            Ok(Event::Text(text)) => {
                if let Some(stream) = current {
                    let encoded = text.unescape().map_err(|err| {
                        ExecError::WinRm(format!("malformed stream text: {err}"))
                    })?;
                    let decoded = BASE64.decode(encoded.trim().as_bytes()).map_err(|err| {
                        ExecError::WinRm(format!("stream chunk is not base64: {err}"))
                    })?;
                    let decoded = String::from_utf8_lossy(&decoded);
                    match stream {
                        "stdout" => chunk.stdout.push_str(&decoded),
                        _ => chunk.stderr.push_str(&decoded),
                    }
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(ExecError::WinRm(format!("malformed receive response: {err}")));
            }
            _ => {}
        }
    }
    Ok(chunk)
}

fn local_matches(qualified: &[u8], local: &str) -> bool {
    let name = match qualified.iter().rposition(|&b| b == b':') {
        Some(pos) => &qualified[pos + 1..],
        None => qualified,
    };
    name == local.as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_command_is_utf16le_base64() {
        // "dir" -> 64 00 69 00 72 00
        assert_eq!(encode_ps_command("dir"), "ZABpAHIA");
    }

    #[test]
    fn extracts_shell_id() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
             xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
            <s:Body><rsp:Shell><rsp:ShellId>F0E1-D2C3</rsp:ShellId></rsp:Shell></s:Body>
        </s:Envelope>"#;
        assert_eq!(extract_element(xml, "ShellId").as_deref(), Some("F0E1-D2C3"));
    }

    #[test]
    fn extracts_selector_shell_id() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
             xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd">
            <s:Body><w:SelectorSet>
                <w:Selector Name="ShellId">AB-12</w:Selector>
            </w:SelectorSet></s:Body>
        </s:Envelope>"#;
        assert_eq!(extract_selector(xml, "ShellId").as_deref(), Some("AB-12"));
    }

    #[test]
    fn receive_response_decodes_streams_and_state() {
        // "VM Successfully Created" / "warning"
        let stdout_b64 = BASE64.encode("VM Successfully Created");
        let stderr_b64 = BASE64.encode("warning");
        let xml = format!(
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
                 xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
            <s:Body><rsp:ReceiveResponse>
                <rsp:Stream Name="stdout" CommandId="C1">{stdout_b64}</rsp:Stream>
                <rsp:Stream Name="stderr" CommandId="C1">{stderr_b64}</rsp:Stream>
                <rsp:CommandState CommandId="C1"
                    State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done">
                    <rsp:ExitCode>0</rsp:ExitCode>
                </rsp:CommandState>
            </rsp:ReceiveResponse></s:Body>
            </s:Envelope>"#
        );
        let chunk = parse_receive_response(&xml).unwrap();
        assert_eq!(chunk.stdout, "VM Successfully Created");
        assert_eq!(chunk.stderr, "warning");
        assert!(chunk.done);
    }

    #[test]
    fn receive_response_running_state_is_not_done() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
             xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
            <s:Body><rsp:ReceiveResponse>
                <rsp:CommandState CommandId="C1"
                    State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Running"/>
            </rsp:ReceiveResponse></s:Body>
        </s:Envelope>"#;
        let chunk = parse_receive_response(xml).unwrap();
        assert!(!chunk.done);
        assert!(chunk.stdout.is_empty());
    }

    #[test]
    fn message_ids_are_uuid_shaped() {
        let id = message_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[4].len(), 12);
    }
}
