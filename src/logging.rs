//! Logging backend which writes to a file, and over UDP when the `debug` feature is enabled.
//!
//! Messages are handed to a background thread, so render-thread hooks never wait on disk.

use std::fs::File;
use std::io::Write;
use std::net;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;

use chrono::Local;
use eyre::{Result, WrapErr};
use log::{Level, Metadata, Record};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug)]
enum MessageType {
    Normal,
    Error,
    Warning,
    Debug,
}

#[derive(Serialize, Deserialize, Debug)]
struct Message {
    module: String,
    msg_type: MessageType,
    string: String,
    time: String,
}

impl Message {
    /// Serialises the message with a little-endian length prefix (which counts itself).
    fn pack(&self) -> Option<Vec<u8>> {
        let serialized = bincode::serialize::<Message>(self).ok()?;

        let mut packed = Vec::from(u32::to_le_bytes((serialized.len() as u32) + 4));
        packed.extend(&serialized);

        Some(packed)
    }

    fn write_to(&self, out: &mut impl Write) {
        let level_name = match self.msg_type {
            MessageType::Normal => "info",
            MessageType::Error => "error",
            MessageType::Warning => "warning",
            MessageType::Debug => "debug",
        };

        //      [date time] [module] [level] Text
        let _ = writeln!(out, "[{}] [{}] [{}] {}", self.time, self.module, level_name, self.string);
    }
}

struct Logger;

impl Logger {
    fn commit(&self, record: &Record) {
        let msg_type = match record.level() {
            Level::Error => MessageType::Error,
            Level::Warn => MessageType::Warning,
            Level::Info => MessageType::Normal,
            Level::Debug | Level::Trace => MessageType::Debug,
        };

        let module = match record.module_path() {
            Some(path) => path.split("::").last().unwrap_or("unknown").to_string(),
            None => return,
        };

        let message = Message {
            module,
            msg_type,
            string: record.args().to_string(),
            time: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        };

        if let Some(sender) = MSG_SENDER.get() {
            if let Ok(sender) = sender.lock() {
                // The writer thread only stops when the process does.
                let _ = sender.send(message);
            }
        }
    }
}

impl log::Log for Logger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.commit(record);
        }
    }

    fn flush(&self) {}
}

static LOGGER: Logger = Logger;
static MSG_SENDER: OnceCell<Mutex<Sender<Message>>> = OnceCell::new();
static PANIC_PATH: OnceCell<PathBuf> = OnceCell::new();

fn panic_hook(info: &std::panic::PanicInfo) {
    let message = info
        .payload()
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| info.payload().downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "no message".to_string());

    let location = info
        .location()
        .map(|location| location.to_string())
        .unwrap_or_else(|| "unknown location".to_string());

    let info_dump = format!(
        "A panic occurred inside the shader layer. The game has been left running.

Message: {}
Location: {}
Time: {}
Backtrace:

{:?}",
        message,
        location,
        Local::now(),
        backtrace::Backtrace::new()
    );

    log::error!("{}", info_dump);

    if let Some(path) = PANIC_PATH.get() {
        let _ = std::fs::write(path, info_dump);
    }
}

/// Starts logging to `path`. If `udp_address` is given and the `debug` feature is enabled,
/// messages are also sent there. Calling this again after a successful call does nothing.
pub fn init(path: &Path, udp_address: Option<&str>) -> Result<()> {
    MSG_SENDER
        .get_or_try_init(|| -> Result<_> {
            let mut file = File::create(path).wrap_err_with(|| format!("failed to create log file {}", path.display()))?;

            let socket = if cfg!(feature = "debug") {
                udp_address.and_then(|_| net::UdpSocket::bind("0.0.0.0:0").ok())
            } else {
                None
            };

            let udp_address = udp_address.map(str::to_string);
            let (sender, receiver) = mpsc::channel::<Message>();

            std::thread::Builder::new()
                .name("shaderfix-log".to_string())
                .spawn(move || {
                    for message in receiver {
                        message.write_to(&mut file);

                        if let (Some(socket), Some(address)) = (&socket, &udp_address) {
                            if let Some(packed) = message.pack() {
                                let _ = socket.send_to(&packed, address);
                            }
                        }
                    }
                })
                .wrap_err("failed to start log thread")?;

            let _ = PANIC_PATH.set(path.with_file_name("PANIC.txt"));
            std::panic::set_hook(Box::new(panic_hook));

            if log::set_logger(&LOGGER).is_ok() {
                log::set_max_level(log::LevelFilter::Debug);
            }

            Ok(Mutex::new(sender))
        })
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message {
            module: "registry".to_string(),
            msg_type: MessageType::Warning,
            string: "hash collision".to_string(),
            time: "2024-01-01 00:00:00.000".to_string(),
        }
    }

    #[test]
    fn writes_formatted_lines() {
        let mut out = vec![];
        message().write_to(&mut out);

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "[2024-01-01 00:00:00.000] [registry] [warning] hash collision\n"
        );
    }

    #[test]
    fn packs_with_length_prefix() {
        let packed = message().pack().unwrap();
        let length = u32::from_le_bytes(packed[..4].try_into().unwrap()) as usize;

        assert_eq!(length, packed.len());

        let unpacked: Message = bincode::deserialize(&packed[4..]).unwrap();
        assert_eq!(unpacked.msg_type, MessageType::Warning);
        assert_eq!(unpacked.string, "hash collision");
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shaderfix.log");

        init(&path, None).unwrap();
        init(&dir.path().join("other.log"), None).unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("other.log").exists());
    }
}
