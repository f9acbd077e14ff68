//! Command-line parsing and the shared options record.
//!
//! The options record is built once, before any I/O, from defaults, the
//! configuration file section matched by the positional argument, and the
//! command line (highest precedence). During a session only the command
//! interpreter mutates it, one whole field at a time.

use clap::Parser;

use crate::configfile;
use crate::transform::MapFlags;

pub const DEFAULT_PREFIX_CODE: u8 = 0x14; // ctrl-t
pub const DEFAULT_PREFIX_KEY: char = 't';
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_PULSE_DURATION_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    Hard,
    Soft,
    None,
}

impl FlowControl {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "hard" => Ok(FlowControl::Hard),
            "soft" => Ok(FlowControl::Soft),
            "none" => Ok(FlowControl::None),
            _ => Err(format!("Invalid flow control: {s}. Must be 'hard', 'soft' or 'none'")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowControl::Hard => "hard",
            FlowControl::Soft => "soft",
            FlowControl::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParityMode {
    Odd,
    Even,
    None,
    Mark,
    Space,
}

impl ParityMode {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "odd" => Ok(ParityMode::Odd),
            "even" => Ok(ParityMode::Even),
            "none" => Ok(ParityMode::None),
            "mark" => Ok(ParityMode::Mark),
            "space" => Ok(ParityMode::Space),
            _ => Err(format!(
                "Invalid parity: {s}. Must be 'odd', 'even', 'none', 'mark' or 'space'"
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParityMode::Odd => "odd",
            ParityMode::Even => "even",
            ParityMode::None => "none",
            ParityMode::Mark => "mark",
            ParityMode::Space => "space",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Hex,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Normal,
    Hex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampMode {
    None,
    TwentyFourHour,
    TwentyFourHourStart,
    TwentyFourHourDelta,
    Iso8601,
}

impl TimestampMode {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "none" => Ok(TimestampMode::None),
            "24hour" => Ok(TimestampMode::TwentyFourHour),
            "24hour-start" => Ok(TimestampMode::TwentyFourHourStart),
            "24hour-delta" => Ok(TimestampMode::TwentyFourHourDelta),
            "iso8601" => Ok(TimestampMode::Iso8601),
            _ => Err(format!("Invalid timestamp format: {s}")),
        }
    }

    /// Ordering used by the in-session timestamp cycle command.
    pub fn next(&self) -> Self {
        match self {
            TimestampMode::None => TimestampMode::TwentyFourHour,
            TimestampMode::TwentyFourHour => TimestampMode::TwentyFourHourStart,
            TimestampMode::TwentyFourHourStart => TimestampMode::TwentyFourHourDelta,
            TimestampMode::TwentyFourHourDelta => TimestampMode::Iso8601,
            TimestampMode::Iso8601 => TimestampMode::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampMode::None => "none",
            TimestampMode::TwentyFourHour => "24hour",
            TimestampMode::TwentyFourHourStart => "24hour-start",
            TimestampMode::TwentyFourHourDelta => "24hour-delta",
            TimestampMode::Iso8601 => "iso8601",
        }
    }

    pub fn enabled(&self) -> bool {
        !matches!(self, TimestampMode::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertMode {
    None,
    Bell,
    Blink,
}

impl AlertMode {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "none" => Ok(AlertMode::None),
            "bell" => Ok(AlertMode::Bell),
            "blink" => Ok(AlertMode::Blink),
            _ => Err(format!("Invalid alert mode: {s}. Must be 'bell', 'blink' or 'none'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptRun {
    Never,
    Once,
    Always,
}

impl ScriptRun {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "never" => Ok(ScriptRun::Never),
            "once" => Ok(ScriptRun::Once),
            "always" => Ok(ScriptRun::Always),
            _ => Err(format!("Invalid script run policy: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    Inline(String),
    File(String),
}

/// Pulse duration per modem line, milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct PulseDurations {
    pub dtr: u64,
    pub rts: u64,
    pub cts: u64,
    pub dsr: u64,
    pub dcd: u64,
    pub ri: u64,
}

impl Default for PulseDurations {
    fn default() -> Self {
        Self {
            dtr: DEFAULT_PULSE_DURATION_MS,
            rts: DEFAULT_PULSE_DURATION_MS,
            cts: DEFAULT_PULSE_DURATION_MS,
            dsr: DEFAULT_PULSE_DURATION_MS,
            dcd: DEFAULT_PULSE_DURATION_MS,
            ri: DEFAULT_PULSE_DURATION_MS,
        }
    }
}

impl PulseDurations {
    /// Parse a `LINE=ms[,LINE=ms...]` list over DTR,RTS,CTS,DSR,DCD,RI.
    pub fn parse(&mut self, spec: &str) -> Result<(), String> {
        for token in spec.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (name, value) = token
                .split_once('=')
                .ok_or_else(|| format!("Invalid line pulse duration: {token}"))?;
            let ms: u64 = value
                .parse()
                .map_err(|_| format!("Invalid pulse duration value: {value}"))?;
            match name {
                "DTR" => self.dtr = ms,
                "RTS" => self.rts = ms,
                "CTS" => self.cts = ms,
                "DSR" => self.dsr = ms,
                "DCD" => self.dcd = ms,
                "RI" => self.ri = ms,
                _ => return Err(format!("Unknown serial line: {name}")),
            }
        }
        Ok(())
    }
}

/// RS-485 configuration parsed from `--rs-485-config`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rs485Config {
    pub rts_on_send: bool,
    pub rts_after_send: bool,
    pub rx_during_tx: bool,
    pub delay_rts_before_send: u32,
    pub delay_rts_after_send: u32,
}

impl Rs485Config {
    /// Parse `KEY=value[,KEY=value...]` over RTS_ON_SEND, RTS_AFTER_SEND,
    /// RTS_DELAY_BEFORE_SEND, RTS_DELAY_AFTER_SEND, RX_DURING_TX.
    pub fn parse(&mut self, spec: &str) -> Result<(), String> {
        for token in spec.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (name, value) = match token.split_once('=') {
                Some((n, v)) => (n, v),
                None => (token, "1"),
            };
            let value: u32 = value
                .parse()
                .map_err(|_| format!("Invalid RS-485 config value: {value}"))?;
            match name {
                "RTS_ON_SEND" => self.rts_on_send = value != 0,
                "RTS_AFTER_SEND" => self.rts_after_send = value != 0,
                "RTS_DELAY_BEFORE_SEND" => self.delay_rts_before_send = value,
                "RTS_DELAY_AFTER_SEND" => self.delay_rts_after_send = value,
                "RX_DURING_TX" => self.rx_during_tx = value != 0,
                _ => return Err(format!("Unknown RS-485 config key: {name}")),
            }
        }
        Ok(())
    }
}

/// The process-wide options record (read-mostly, see module docs).
#[derive(Debug, Clone)]
pub struct Options {
    pub device: String,
    pub baudrate: u32,
    pub databits: u8,
    pub flow: FlowControl,
    pub stopbits: u8,
    pub parity: ParityMode,
    pub output_delay: u64,
    pub output_line_delay: u64,
    pub pulse: PulseDurations,
    pub map: MapFlags,
    pub prefix_code: u8,
    pub prefix_key: char,
    pub prefix_enabled: bool,
    pub input_mode: InputMode,
    pub output_mode: OutputMode,
    pub timestamp: TimestampMode,
    pub local_echo: bool,
    pub log: bool,
    pub log_filename: Option<String>,
    pub log_strip: bool,
    /// -1 = no color, 0..=255 = ANSI color index, 256 = bold only.
    pub color: i16,
    pub alert: AlertMode,
    pub response_wait: bool,
    pub response_timeout: u64,
    pub rs485: bool,
    pub rs485_config: Rs485Config,
    pub auto_connect: bool,
    pub mute: bool,
    pub socket: Option<String>,
    pub script: Option<ScriptSource>,
    pub script_run: ScriptRun,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            device: String::new(),
            baudrate: 115200,
            databits: 8,
            flow: FlowControl::None,
            stopbits: 1,
            parity: ParityMode::None,
            output_delay: 0,
            output_line_delay: 0,
            pulse: PulseDurations::default(),
            map: MapFlags::empty(),
            prefix_code: DEFAULT_PREFIX_CODE,
            prefix_key: DEFAULT_PREFIX_KEY,
            prefix_enabled: true,
            input_mode: InputMode::Normal,
            output_mode: OutputMode::Normal,
            timestamp: TimestampMode::None,
            local_echo: false,
            log: false,
            log_filename: None,
            log_strip: false,
            color: -1,
            alert: AlertMode::None,
            response_wait: false,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT_MS,
            rs485: false,
            rs485_config: Rs485Config::default(),
            auto_connect: true,
            mute: false,
            socket: None,
            script: None,
            script_run: ScriptRun::Never,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "serterm")]
#[command(version, disable_version_flag = true)]
#[command(about = "Interactive serial-line terminal", long_about = None)]
pub struct Cli {
    /// Serial device path, or a configuration section name
    pub device: Option<String>,

    /// Display version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Baud rate
    #[arg(short = 'b', long)]
    pub baudrate: Option<u32>,

    /// Data bits (5, 6, 7 or 8)
    #[arg(short = 'd', long, value_name = "BITS")]
    pub databits: Option<u8>,

    /// Flow control (hard, soft or none)
    #[arg(short = 'f', long)]
    pub flow: Option<String>,

    /// Stop bits (1 or 2)
    #[arg(short = 's', long, value_name = "BITS")]
    pub stopbits: Option<u8>,

    /// Parity (odd, even, none, mark or space)
    #[arg(short = 'p', long)]
    pub parity: Option<String>,

    /// Delay between each transmitted byte (ms)
    #[arg(short = 'o', long, value_name = "MS")]
    pub output_delay: Option<u64>,

    /// Delay after each transmitted line (ms)
    #[arg(short = 'O', long, value_name = "MS")]
    pub output_line_delay: Option<u64>,

    /// Line pulse durations, e.g. DTR=100,RTS=50
    #[arg(long, value_name = "LINE=MS,...")]
    pub line_pulse_duration: Option<String>,

    /// Disable automatic reconnect
    #[arg(short = 'n', long)]
    pub no_autoconnect: bool,

    /// Enable local echo
    #[arg(short = 'e', long)]
    pub local_echo: bool,

    /// Enable line timestamps (24hour)
    #[arg(short = 't', long)]
    pub timestamp: bool,

    /// Timestamp format (24hour, 24hour-start, 24hour-delta, iso8601)
    #[arg(long, value_name = "FORMAT")]
    pub timestamp_format: Option<String>,

    /// List available serial devices and exit
    #[arg(short = 'L', long)]
    pub list_devices: bool,

    /// Enable log to file
    #[arg(short = 'l', long)]
    pub log: bool,

    /// Log file name (default: automatically generated)
    #[arg(long, value_name = "FILENAME")]
    pub log_file: Option<String>,

    /// Strip control characters and escape sequences from the log
    #[arg(long)]
    pub log_strip: bool,

    /// Map characters (csv of INLCR,IGNCR,ICRNL,OCRNL,ODELBS,IFFESCC,INLCRNL,ONLCRNL,OLTU,ONULBRK,MSB2LSB)
    #[arg(short = 'm', long, value_name = "FLAGS")]
    pub map: Option<String>,

    /// Colorize status messages (0..255, "bold", "none" or "list")
    #[arg(short = 'c', long, value_name = "COLOR")]
    pub color: Option<String>,

    /// Redirect I/O to socket (unix:PATH, inet:PORT or inet6:PORT)
    #[arg(short = 'S', long, value_name = "SOCKET")]
    pub socket: Option<String>,

    /// Enable hexadecimal mode
    #[arg(short = 'x', long)]
    pub hexadecimal: bool,

    /// Wait for device response (CR/LF) then exit
    #[arg(short = 'r', long)]
    pub response_wait: bool,

    /// Response wait timeout (ms)
    #[arg(long, value_name = "MS")]
    pub response_timeout: Option<u64>,

    /// Enable RS-485 mode
    #[arg(long = "rs-485")]
    pub rs485: bool,

    /// RS-485 configuration
    #[arg(long = "rs-485-config", value_name = "CONFIG")]
    pub rs485_config: Option<String>,

    /// Alert on connect/disconnect (bell, blink or none)
    #[arg(long, value_name = "MODE")]
    pub alert: Option<String>,

    /// Mute status messages
    #[arg(long)]
    pub mute: bool,

    /// Inline script to run against the device
    #[arg(long, value_name = "SCRIPT")]
    pub script: Option<String>,

    /// Script file to run against the device
    #[arg(long, value_name = "FILENAME")]
    pub script_file: Option<String>,

    /// Script run policy (never, once or always)
    #[arg(long, value_name = "POLICY")]
    pub script_run: Option<String>,
}

/// Parse the color argument. Returns the color index, or an action request.
pub enum ColorArg {
    Index(i16),
    List,
}

pub fn parse_color(arg: &str) -> Result<ColorArg, String> {
    match arg {
        "list" => Ok(ColorArg::List),
        "none" => Ok(ColorArg::Index(-1)),
        "bold" => Ok(ColorArg::Index(256)),
        _ => {
            let index: i16 = arg.parse().map_err(|_| format!("Invalid color value: {arg}"))?;
            if !(0..=255).contains(&index) {
                return Err(format!("Color value out of range: {index}"));
            }
            Ok(ColorArg::Index(index))
        }
    }
}

/// Build the options record from the command line and the configuration
/// file. Configuration errors are fatal before connect.
pub fn resolve(cli: &Cli) -> Result<Options, String> {
    let mut opts = Options::default();

    // The positional argument selects a configuration file section before
    // command-line flags are applied on top.
    if let Some(user) = &cli.device {
        opts.device = user.clone();
        configfile::apply(&mut opts, user)?;
    }

    if let Some(b) = cli.baudrate {
        opts.baudrate = b;
    }
    if let Some(d) = cli.databits {
        opts.databits = d;
    }
    if let Some(f) = &cli.flow {
        opts.flow = FlowControl::parse(f)?;
    }
    if let Some(s) = cli.stopbits {
        opts.stopbits = s;
    }
    if let Some(p) = &cli.parity {
        opts.parity = ParityMode::parse(p)?;
    }
    if let Some(ms) = cli.output_delay {
        opts.output_delay = ms;
    }
    if let Some(ms) = cli.output_line_delay {
        opts.output_line_delay = ms;
    }
    if let Some(spec) = &cli.line_pulse_duration {
        opts.pulse.parse(spec)?;
    }
    if cli.no_autoconnect {
        opts.auto_connect = false;
    }
    if cli.local_echo {
        opts.local_echo = true;
    }
    if cli.timestamp {
        opts.timestamp = TimestampMode::TwentyFourHour;
    }
    if let Some(fmt) = &cli.timestamp_format {
        opts.timestamp = TimestampMode::parse(fmt)?;
    }
    if cli.log {
        opts.log = true;
    }
    if let Some(name) = &cli.log_file {
        opts.log = true;
        opts.log_filename = Some(name.clone());
    }
    if cli.log_strip {
        opts.log_strip = true;
    }
    if let Some(csv) = &cli.map {
        opts.map = MapFlags::parse(csv)?;
    }
    if let Some(color) = &cli.color {
        match parse_color(color)? {
            ColorArg::Index(index) => opts.color = index,
            // "list" is handled before resolve() by the caller.
            ColorArg::List => {}
        }
    }
    if let Some(socket) = &cli.socket {
        opts.socket = Some(socket.clone());
    }
    if cli.hexadecimal {
        opts.input_mode = InputMode::Hex;
        opts.output_mode = OutputMode::Hex;
    }
    if cli.response_wait {
        opts.response_wait = true;
    }
    if let Some(ms) = cli.response_timeout {
        opts.response_wait = true;
        opts.response_timeout = ms;
    }
    if cli.rs485 {
        opts.rs485 = true;
    }
    if let Some(cfg) = &cli.rs485_config {
        opts.rs485 = true;
        opts.rs485_config.parse(cfg)?;
    }
    if let Some(alert) = &cli.alert {
        opts.alert = AlertMode::parse(alert)?;
    }
    if cli.mute {
        opts.mute = true;
    }
    if let Some(source) = &cli.script {
        opts.script = Some(ScriptSource::Inline(source.clone()));
        opts.script_run = ScriptRun::Always;
    }
    if let Some(path) = &cli.script_file {
        opts.script = Some(ScriptSource::File(path.clone()));
        opts.script_run = ScriptRun::Always;
    }
    if let Some(policy) = &cli.script_run {
        opts.script_run = ScriptRun::parse(policy)?;
    }

    validate(&opts)?;
    Ok(opts)
}

fn validate(opts: &Options) -> Result<(), String> {
    if opts.device.is_empty() {
        return Err("Missing device name".into());
    }
    if !(5..=8).contains(&opts.databits) {
        return Err(format!("Invalid data bits: {}. Must be 5, 6, 7 or 8", opts.databits));
    }
    if !matches!(opts.stopbits, 1 | 2) {
        return Err(format!("Invalid stop bits: {}. Must be 1 or 2", opts.stopbits));
    }
    if opts.baudrate == 0 {
        return Err("Invalid baud rate".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_duration_list_parses() {
        let mut pulse = PulseDurations::default();
        pulse.parse("DTR=50,RI=250").unwrap();
        assert_eq!(pulse.dtr, 50);
        assert_eq!(pulse.ri, 250);
        assert_eq!(pulse.rts, DEFAULT_PULSE_DURATION_MS);
    }

    #[test]
    fn pulse_duration_rejects_unknown_line() {
        let mut pulse = PulseDurations::default();
        assert!(pulse.parse("DCE=50").is_err());
    }

    #[test]
    fn color_argument_forms() {
        assert!(matches!(parse_color("none"), Ok(ColorArg::Index(-1))));
        assert!(matches!(parse_color("bold"), Ok(ColorArg::Index(256))));
        assert!(matches!(parse_color("15"), Ok(ColorArg::Index(15))));
        assert!(matches!(parse_color("list"), Ok(ColorArg::List)));
        assert!(parse_color("256").is_err());
        assert!(parse_color("red").is_err());
    }

    #[test]
    fn rs485_config_parses() {
        let mut cfg = Rs485Config::default();
        cfg.parse("RTS_ON_SEND=1,RTS_DELAY_AFTER_SEND=20,RX_DURING_TX").unwrap();
        assert!(cfg.rts_on_send);
        assert!(!cfg.rts_after_send);
        assert!(cfg.rx_during_tx);
        assert_eq!(cfg.delay_rts_after_send, 20);
    }

    #[test]
    fn timestamp_cycle_wraps() {
        let mut mode = TimestampMode::None;
        for _ in 0..5 {
            mode = mode.next();
        }
        assert_eq!(mode, TimestampMode::None);
    }
}
