use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::cli::ProbeOpts;
use crate::display::format_parameters;
use crate::engine::{CommandEngine, CommandResult};
use crate::port::open_duplex;
use crate::proto::command::{AdvParameters, Command, FirmwareInfo};
use crate::proto::frame::Fields;
use crate::reader::spawn_reader;

/// One-shot module interrogation: liveness, identity, advertising setup.
/// Changes nothing on the device.
pub fn run(opts: ProbeOpts) -> Result<()> {
    let (read_half, write_half) = open_duplex(&opts.ser)?;
    let stop = Arc::new(AtomicBool::new(false));
    let (resp_tx, resp_rx) = mpsc::channel();
    let (event_tx, event_rx) = mpsc::channel();
    let reader = spawn_reader(read_half, resp_tx, event_tx, Arc::clone(&stop));
    // Unsolicited events are irrelevant here, but the receiver has to stay
    // alive or the reader treats the session as over.
    let _events = event_rx;

    let mut engine = CommandEngine::new(
        write_half,
        resp_rx,
        Duration::from_millis(opts.timeout_ms),
        1,
    );
    let outcome = probe(&mut engine);

    stop.store(true, Ordering::Relaxed);
    let _ = reader.join();
    outcome
}

fn probe<W: Write>(engine: &mut CommandEngine<W>) -> Result<()> {
    let fields = query(engine, Command::Ping, "ping")?;
    match fields.get("U") {
        Some(_) => {
            let up = fields.hex_u32("U").context("parsing ping reply")?;
            println!("module answered ping (up {} s)", up);
        }
        None => println!("module answered ping"),
    }

    let fields = query(engine, Command::QueryFirmwareVersion, "firmware query")?;
    let fw = FirmwareInfo::from_fields(&fields).context("parsing firmware version reply")?;
    println!("firmware: {}", fw);
    if !fw.supports_extended_adv() {
        println!("note: this firmware has no extended advertising support");
    }

    let fields = query(engine, Command::GetAdvParameters, "advertising parameter query")?;
    let params = AdvParameters::from_fields(&fields).context("parsing advertising parameters")?;
    println!();
    println!("{}", format_parameters(&params));
    println!();

    // Older firmware refuses GEAD outright; show that instead of failing.
    match engine.execute(&Command::GetAdvData)? {
        CommandResult::Ok(fields) => match fields.get("D") {
            Some(d) if !d.is_empty() => {
                println!("advertising data: {} ({} bytes)", d, d.len() / 2)
            }
            _ => println!("advertising data: none"),
        },
        CommandResult::DeviceError(code) => {
            println!("advertising data: unavailable (device error 0x{:04X})", code)
        }
        CommandResult::Timeout => println!("advertising data: no response"),
    }
    Ok(())
}

fn query<W: Write>(engine: &mut CommandEngine<W>, cmd: Command, what: &str) -> Result<Fields> {
    match engine.execute(&cmd).with_context(|| what.to_string())? {
        CommandResult::Ok(fields) => Ok(fields),
        CommandResult::DeviceError(code) => bail!("{}: device error 0x{:04X}", what, code),
        CommandResult::Timeout => bail!("{}: no response from module", what),
    }
}
