//! The embedded automation interpreter.
//!
//! Scripts drive the connected device through a small procedural API:
//! sleep/msleep, modem line control (immediate and deferred), file
//! transfer, send, expect and exit. See [`parser`] for the statement
//! syntax. A script runs on the main task with the device attached;
//! the launch policy decides whether it fires on first connect, every
//! connect, or not at all.

pub mod parser;

use std::io::Write;

use thiserror::Error;

use crate::device::lines::{self, ModemLine};
use crate::options::ScriptSource;
use crate::session::Session;
use crate::transfer::{self, Protocol};
use crate::{status, warning};

use parser::{Call, Expr};

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("{0}")]
    Parse(#[from] parser::ParseError),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("unknown constant '{0}'")]
    UnknownConstant(String),

    #[error("{0}: invalid argument")]
    BadArgument(&'static str),

    #[error("script exit")]
    Exit(i32),
}

pub type Result<T> = std::result::Result<T, ScriptError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
    Unit,
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Unit => Ok(()),
        }
    }
}

/// Protocol constants exposed to scripts.
const XMODEM_1K: i64 = 0;
const XMODEM_CRC: i64 = 1;
const YMODEM: i64 = 2;

/// Run the configured script against the connected device. Returns an
/// exit code when the script called exit(); script failures are warned
/// about and the session continues.
pub async fn run(session: &mut Session) -> Option<i32> {
    let source = match session.opts().script.clone() {
        Some(ScriptSource::Inline(text)) => {
            status!("Running script");
            text
        }
        Some(ScriptSource::File(path)) => {
            status!("Running script {path}");
            match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    warning!("Could not read script {path} ({e})");
                    return None;
                }
            }
        }
        None => {
            warning!("Missing script");
            return None;
        }
    };

    let program = match parser::parse(&source) {
        Ok(program) => program,
        Err(e) => {
            warning!("script: {e}");
            return None;
        }
    };

    for call in &program {
        match eval_call(session, call).await {
            Ok(_) => {}
            Err(ScriptError::Exit(code)) => return Some(code),
            Err(e) => {
                warning!("script: {e}");
                return None;
            }
        }
    }
    None
}

fn eval<'a>(
    session: &'a mut Session,
    expr: &'a Expr,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value>> + 'a>> {
    Box::pin(async move {
        match expr {
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Ident(name) => constant(name),
            Expr::Call(call) => eval_call(session, call).await,
        }
    })
}

fn constant(name: &str) -> Result<Value> {
    let value = match name {
        "DTR" => ModemLine::Dtr.mask() as i64,
        "RTS" => ModemLine::Rts.mask() as i64,
        "CTS" => ModemLine::Cts.mask() as i64,
        "DSR" => ModemLine::Dsr.mask() as i64,
        "DCD" | "CD" => ModemLine::Dcd.mask() as i64,
        "RI" => ModemLine::Ri.mask() as i64,
        "XMODEM_1K" => XMODEM_1K,
        "XMODEM_CRC" => XMODEM_CRC,
        "YMODEM" => YMODEM,
        _ => return Err(ScriptError::UnknownConstant(name.to_string())),
    };
    Ok(Value::Int(value))
}

async fn eval_call(session: &mut Session, call: &Call) -> Result<Value> {
    let mut args = Vec::with_capacity(call.args.len());
    for arg in &call.args {
        args.push(eval(session, arg).await?);
    }
    apply(session, &call.name, args).await
}

fn int_arg(args: &[Value], index: usize, name: &'static str) -> Result<i64> {
    match args.get(index) {
        Some(Value::Int(n)) => Ok(*n),
        _ => Err(ScriptError::BadArgument(name)),
    }
}

fn str_arg(args: &[Value], index: usize, name: &'static str) -> Result<String> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(s.clone()),
        _ => Err(ScriptError::BadArgument(name)),
    }
}

fn line_arg(args: &[Value], name: &'static str) -> Result<Option<ModemLine>> {
    let mask = int_arg(args, 0, name)?;
    if mask < 0 {
        return Ok(None);
    }
    Ok(ModemLine::from_mask(mask as libc::c_int))
}

async fn apply(session: &mut Session, name: &str, args: Vec<Value>) -> Result<Value> {
    match name {
        "sleep" => {
            let seconds = int_arg(&args, 0, "sleep")?;
            if seconds >= 0 {
                status!("Sleeping {seconds} seconds");
                tokio::time::sleep(std::time::Duration::from_secs(seconds as u64)).await;
            }
            Ok(Value::Unit)
        }
        "msleep" => {
            let ms = int_arg(&args, 0, "msleep")?;
            if ms >= 0 {
                status!("Sleeping {ms} ms");
                tokio::time::sleep(std::time::Duration::from_millis(ms as u64)).await;
            }
            Ok(Value::Unit)
        }
        "high" | "low" => {
            if let Some(line) = line_arg(&args, "high/low")? {
                if let Some(fd) = session.port_fd() {
                    if let Err(e) = lines::line_set(fd, line, name == "high") {
                        warning!("Could not set line state ({e})");
                    }
                } else {
                    warning!("Not connected");
                }
            }
            Ok(Value::Unit)
        }
        "toggle" => {
            if let Some(line) = line_arg(&args, "toggle")? {
                if let Some(fd) = session.port_fd() {
                    if let Err(e) = lines::line_toggle(fd, line) {
                        warning!("Could not set line state ({e})");
                    }
                } else {
                    warning!("Not connected");
                }
            }
            Ok(Value::Unit)
        }
        "config_high" | "config_low" => {
            if let Some(line) = line_arg(&args, "config_high/config_low")? {
                session.line_table_mut().config(line, name == "config_high");
            }
            Ok(Value::Unit)
        }
        "config_apply" => {
            if let Some(fd) = session.port_fd() {
                let mut table = std::mem::take(session.line_table_mut());
                if let Err(e) = table.apply(fd) {
                    warning!("Could not set line state configuration ({e})");
                }
                *session.line_table_mut() = table;
            } else {
                warning!("Not connected");
            }
            Ok(Value::Unit)
        }
        "modem_send" => {
            let file = str_arg(&args, 0, "modem_send")?;
            let protocol = match int_arg(&args, 1, "modem_send")? {
                XMODEM_1K => Protocol::Xmodem1k,
                XMODEM_CRC => Protocol::XmodemCrc,
                YMODEM => Protocol::Ymodem,
                _ => return Err(ScriptError::BadArgument("modem_send")),
            };
            status!("Sending file '{}' using {}", file, protocol.name());
            match transfer::send(session, &file, protocol).await {
                Ok(()) => status!("Done"),
                Err(e) => {
                    log::debug!("transfer failed: {e}");
                    status!("Aborted");
                }
            }
            Ok(Value::Unit)
        }
        "send" => {
            let text = str_arg(&args, 0, "send")?;
            let Some(port) = session.port_mut() else {
                warning!("Not connected");
                return Ok(Value::Int(-1));
            };
            match port.write_direct(text.as_bytes()) {
                Ok(count) => Ok(Value::Int(count as i64)),
                Err(e) => {
                    warning!("{e}");
                    Ok(Value::Int(-1))
                }
            }
        }
        "expect" => {
            let pattern = match args.first() {
                Some(Value::Str(s)) => s.clone(),
                _ => return Ok(Value::Int(-1)),
            };
            let timeout = match args.get(1) {
                Some(Value::Int(n)) => *n,
                None => 0,
                _ => return Ok(Value::Int(-1)),
            };
            Ok(Value::Int(session.expect(&pattern, timeout).await as i64))
        }
        "exit" => {
            let code = int_arg(&args, 0, "exit").unwrap_or(0);
            Err(ScriptError::Exit(code as i32))
        }
        "print" => {
            let mut out = std::io::stdout().lock();
            let _ = write!(out, "{}\r\n", args.first().unwrap_or(&Value::Unit));
            let _ = out.flush();
            Ok(Value::Unit)
        }
        _ => Err(ScriptError::UnknownFunction(name.to_string())),
    }
}
