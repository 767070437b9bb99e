use std::io::{self, Write};

use crossterm::ExecutableCommand;
use crossterm::cursor::MoveTo;
use crossterm::terminal::{Clear, ClearType};

use crate::controller::ExperimentState;
use crate::proto::command::{AdvParameters, FLAG_AUTO_START, FLAG_CUSTOM_DATA, ms_from_units};
use crate::proto::frame::to_hex;
use crate::stats::RoundLive;

/// Which detail pane the operator is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    Payload,
    Parameters,
}

/// Where rendered snapshots go. The terminal sink is the real one; tests
/// render into strings.
pub trait DisplaySink {
    fn render(&mut self, text: &str) -> io::Result<()>;
}

pub struct TerminalDisplay {
    out: io::Stdout,
}

impl TerminalDisplay {
    pub fn new() -> Self {
        Self { out: io::stdout() }
    }
}

impl DisplaySink for TerminalDisplay {
    /// Clears and repaints. Raw mode is active, so every line needs an
    /// explicit carriage return.
    fn render(&mut self, text: &str) -> io::Result<()> {
        self.out.execute(MoveTo(0, 0))?;
        self.out.execute(Clear(ClearType::All))?;
        for line in text.lines() {
            self.out.write_all(line.as_bytes())?;
            self.out.write_all(b"\r\n")?;
        }
        self.out.flush()
    }
}

/// One full screen: status header, live round counters, the selected detail
/// pane and the key legend.
pub fn render_snapshot(state: &ExperimentState, live: &RoundLive) -> String {
    let mut lines = Vec::new();
    let hz = 1000.0 / state.adv_interval_ms as f64;
    lines.push(format!(
        "adv-lab | {} | {} | interval {} ms ({:.1} Hz)",
        state.phase, state.device_name, state.adv_interval_ms, hz
    ));
    match &state.firmware {
        Some(fw) => lines.push(format!("module: {}", fw)),
        None => lines.push("module: not identified".to_string()),
    }
    let rate = if live.elapsed_secs > 0.0 {
        live.packets as f64 / live.elapsed_secs
    } else {
        0.0
    };
    lines.push(format!(
        "round {}: {} packets, {} errors, {:.1} s ({:.1} p/s)",
        live.round, live.packets, live.errors, live.elapsed_secs, rate
    ));
    match &state.last_round {
        Some(r) => lines.push(format!(
            "last sealed: round {} -> {} packets in {:.3} s = {:.3} p/s, {} errors",
            r.round, r.packets, r.duration_secs, r.throughput, r.errors
        )),
        None => lines.push("last sealed: none yet".to_string()),
    }
    lines.push(String::new());

    match state.mode {
        DisplayMode::Payload => match &state.payload {
            Some(p) => lines.push(format_payload(p.bytes())),
            None => lines.push("No advertisement payload set.".to_string()),
        },
        DisplayMode::Parameters => match &state.params {
            Some(p) => lines.push(format_parameters(p)),
            None => lines.push("No advertising parameters cached.".to_string()),
        },
    }

    lines.push(String::new());
    lines.push("keys: p payload | g parameters | s slower | f faster | q quit".to_string());
    lines.join("\n")
}

/// Decoded AD-structure view of a raw advertising payload.
pub fn format_payload(bytes: &[u8]) -> String {
    let mut lines = Vec::new();
    lines.push(format!("Raw Payload: {}", to_hex(bytes)));
    lines.push(format!("Total Raw Payload Size: {} bytes", bytes.len()));
    lines.push(String::new());

    let mut rest = bytes;
    let mut idx = 1;
    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if len == 0 || len > tail.len() {
            lines.push(format!(
                "Field {}: truncated structure (length byte {})",
                idx, len
            ));
            break;
        }
        let (field, next) = tail.split_at(len);
        let ad_type = field[0];
        let data = &field[1..];
        lines.push(format!(
            "Field {}: Length = {}, AD Type = 0x{:02X} ({}), Data = {}",
            idx,
            len,
            ad_type,
            ad_type_name(ad_type),
            to_hex(data)
        ));
        if ad_type == 0xFF && data.len() >= 6 {
            let marker = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
            lines.push(format!("         Company ID = {}", to_hex(&data[..2])));
            lines.push(format!("         Marker     = {}", marker));
            lines.push(format!("         Filler     = {} bytes", data.len() - 6));
        }
        rest = next;
        idx += 1;
    }
    lines.join("\n")
}

/// Descriptive listing of the full advertising parameter set, one line per
/// wire field.
pub fn format_parameters(p: &AdvParameters) -> String {
    let ms = ms_from_units(p.interval_units);
    let mut lines = Vec::new();
    lines.push("Extended Advertising Parameters:".to_string());
    lines.push(format!(
        "P (Adv_mode) = {:02X} -> {}",
        p.mode,
        adv_mode_name(p.mode)
    ));
    lines.push(format!(
        "M (Disc_mode) = {:02X} -> {}",
        p.discovery,
        discovery_name(p.discovery)
    ));
    lines.push(format!(
        "T (Type) = {:02X} -> {}",
        p.adv_type,
        adv_type_desc(p.adv_type)
    ));
    lines.push(format!(
        "H (Primary_phy) = {:02X} -> {}",
        p.primary_phy,
        phy_name(p.primary_phy)
    ));
    lines.push(format!(
        "I (Interval) = {:04X} -> {:.2} ms = {:.2} s",
        p.interval_units,
        ms,
        ms / 1000.0
    ));
    lines.push(format!(
        "C (Channels) = {:02X} -> {}",
        p.channels,
        channels_desc(p.channels)
    ));
    lines.push(format!(
        "L (Filter) = {:02X} -> {}",
        p.filter_policy,
        filter_name(p.filter_policy)
    ));
    lines.push(format!(
        "O (Timeout) = {:04X} -> {} seconds",
        p.timeout_s, p.timeout_s
    ));
    lines.push(format!(
        "F (Flags) = {:02X} -> {}",
        p.flags,
        flags_desc(p.flags)
    ));
    lines.push(format!(
        "A (Directed Adv Address) = {} -> {}",
        to_hex(&p.direct_addr),
        format_mac(&p.direct_addr)
    ));
    lines.push(format!(
        "Y (Directed Addr Type) = {:02X} -> {}",
        p.direct_addr_type,
        addr_type_name(p.direct_addr_type)
    ));
    lines.push(format!(
        "E (Secondary_phy) = {:02X} -> {}",
        p.secondary_phy,
        phy_name(p.secondary_phy)
    ));
    lines.push(format!(
        "S (Secondary_max_skip) = {:02X} -> {}",
        p.secondary_max_skip, p.secondary_max_skip
    ));
    lines.push(format!("D (Secondary_SID) = {:02X} -> {}", p.sid, p.sid));
    lines.push(format!(
        "N (Periodic_interval) = {:04X} -> {:.2} ms",
        p.periodic_units,
        p.periodic_units as f64 * 1.25
    ));
    lines.join("\n")
}

/* ---------- decode tables ---------- */

fn ad_type_name(t: u8) -> &'static str {
    match t {
        0x01 => "Flags",
        0x08 => "Shortened Local Name",
        0x09 => "Complete Local Name",
        0x0A => "Tx Power Level",
        0x16 => "Service Data",
        0xFF => "Manufacturer Specific Data",
        _ => "Unknown",
    }
}

fn adv_mode_name(v: u8) -> &'static str {
    match v {
        0 => "Legacy (factory default)",
        1 => "Extended",
        2 => "Periodic",
        _ => "Unknown",
    }
}

fn discovery_name(v: u8) -> &'static str {
    match v {
        0 => "Non-discoverable/broadcast-only",
        1 => "General discovery (factory default)",
        _ => "Unknown",
    }
}

fn adv_type_desc(v: u8) -> &'static str {
    match v {
        0x00 => "Legacy: Connectable, undirected (factory default)",
        0x01 => "Legacy: Connectable, directed",
        0x02 => "Legacy: Scannable, undirected",
        0x03 => "Legacy: Non-connectable, undirected",
        0x04 => "Periodic: Undirected",
        0x05 => "Periodic: Directed",
        0x06 => "Extended: Undirected connectable",
        0x07 => "Extended: Directed connectable",
        0x08 => "Extended: Non-connectable, non-scannable",
        0x09 => "Extended: Non-connectable, scannable",
        0x0A => "Extended: Non-connectable anonymous directed",
        _ => "Unknown",
    }
}

fn phy_name(v: u8) -> &'static str {
    match v {
        0 => "1M (factory default)",
        1 => "2M",
        2 => "Coded",
        _ => "Unknown",
    }
}

fn filter_name(v: u8) -> &'static str {
    match v {
        0 => "Scan and connect from any (factory default)",
        1 => "Scan whitelist-only, connect from any",
        2 => "Scan from any, connect whitelist-only",
        3 => "Scan and connect whitelist-only",
        _ => "Unknown",
    }
}

fn addr_type_name(v: u8) -> &'static str {
    match v {
        0 => "BLE_ADDR_PUBLIC",
        1 => "BLE_ADDR_RANDOM",
        _ => "Unknown",
    }
}

fn channels_desc(mask: u8) -> String {
    let mut parts = Vec::new();
    if mask & 0x01 != 0 {
        parts.push("Channel 37");
    }
    if mask & 0x02 != 0 {
        parts.push("Channel 38");
    }
    if mask & 0x04 != 0 {
        parts.push("Channel 39");
    }
    if parts.is_empty() {
        "no primary channels".to_string()
    } else {
        parts.join(", ")
    }
}

fn flags_desc(flags: u8) -> String {
    let mut parts = Vec::new();
    if flags & FLAG_AUTO_START != 0 {
        parts.push("Auto-start on boot/disconnection");
    }
    if flags & FLAG_CUSTOM_DATA != 0 {
        parts.push("Use custom adv/scan response data");
    }
    if parts.is_empty() {
        "No flags set, factory default".to_string()
    } else {
        parts.join(", ")
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
