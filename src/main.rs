//! Riden RD60xx power supply CLI
//!
//! A command-line interface (CLI) application for controlling Riden RD60xx
//! laboratory power supplies over their USB serial port or a serial-to-network
//! bridge.
//!
//! This tool allows users to:
//! - Print set-points, measurements and battery charging values (also as JSON).
//! - Change voltage, current and protection limits, absolute or relative.
//! - Switch the output.
//! - Read and write raw registers, dump and compare the register space.
//! - Read and store preset memories.
//! - Set the device clock.
//! - Watch the device state or its register changes continuously.
//!
//! The CLI leverages the `rd60xx_lib` crate for protocol and client operations.

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use clap::Parser;
use dialoguer::Confirm;
use directories_next::ProjectDirs;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use rd60xx_lib::client::{Rd60xx, State};
use rd60xx_lib::config::{Config, Connection, TEMPLATE};
use rd60xx_lib::profile::Profile;
use rd60xx_lib::registers::{self, addr, RegisterRef};
use rd60xx_lib::store::{RegisterChange, WriteMode};
use rd60xx_lib::transport::Transport;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::panic;

mod commandline;

use commandline::{CliArgs, CliCommands, Quantity, SetValue};

/// Registers printed by `regs` without options.
const STATE_REGISTER_COUNT: usize = registers::STATE_BLOCK_LENGTH as usize;
/// Registers printed by `regs --all`.
const ALL_REGISTER_COUNT: usize = 120;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

fn user_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "rd60").map(|dirs| dirs.config_dir().join("config.yml"))
}

/// Finds the configuration file: the commandline option, `./rd60.yml` or the
/// user configuration directory.
fn config_file_path(option: Option<&Path>) -> Option<PathBuf> {
    let local_file = Path::new("rd60.yml");
    match (option, user_config_path()) {
        (Some(config), _) => Some(config.to_path_buf()),
        (None, _) if local_file.exists() => Some(local_file.to_path_buf()),
        (None, Some(config)) if config.exists() => Some(config),
        _ => None,
    }
}

/// Loads the configuration and applies the commandline overrides.
fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = match config_file_path(args.config.as_deref()) {
        Some(path) => {
            debug!("Loading config file from {path:?}");
            let file = File::open(&path)
                .with_context(|| format!("Cannot open config file {}", path.display()))?;
            Config::from_reader(file)
                .with_context(|| format!("Cannot parse config file {}", path.display()))?
        }
        None => Config::default(),
    };

    if let Some(target) = &args.tcp {
        config.connection = Connection::Tcp {
            host: target.host.clone(),
            port: target.port,
        };
    }
    if let Some(target) = &args.serial {
        config.connection = Connection::Serial {
            device: target.device.clone(),
            baud_rate: target.baud_rate,
        };
    }
    if let Some(unit) = args.unit {
        config.unit = unit;
    }
    if let Some(timeout) = args.timeout {
        config.timeout = timeout;
    }
    if let Some(retries) = args.retries {
        config.retries = retries;
    }
    config.robust |= args.robust;
    if let Some(battery) = args.battery_mode() {
        config.battery = Some(battery);
    }
    Ok(config)
}

fn print_register(address: u16, value: u16, force: bool) {
    let register = registers::by_address(address);
    if register.is_none() && value == 0 && !force {
        return;
    }
    let name = register.map_or("", |r| r.name);
    let mode = register.map_or(String::from("?"), |r| r.access.to_string());
    let description = register.map_or_else(
        || format!("register {address}"),
        |r| r.description.to_string(),
    );
    println!(
        "x{address:02x} {address:>3}  {value:>5} 0x{value:04x} {mode:<2}  {name:<14} {description}"
    );
}

fn print_changes(changes: &[RegisterChange]) {
    println!();
    println!("DIFFREG:");
    for change in changes {
        for value in [change.previous, change.current] {
            match value {
                Some(value) => print_register(change.address, value, true),
                None => println!("x{0:02x} {0:>3}      ?", change.address),
            }
        }
    }
    println!();
}

fn timestamp(utc: bool) -> String {
    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";
    if utc {
        Utc::now().format(FORMAT).to_string()
    } else {
        Local::now().format(FORMAT).to_string()
    }
}

fn print_state_json(state: &State, short: bool, time: Option<String>) -> Result<()> {
    let mut value = serde_json::to_value(state).context("Cannot serialize state")?;
    if let serde_json::Value::Object(map) = &mut value {
        if short {
            map.retain(|key, _| matches!(key.as_str(), "Vout" | "Iout" | "Vbat"));
        }
        if let Some(time) = time {
            map.insert(String::from("time"), serde_json::Value::String(time));
        }
    }
    println!("{value}");
    Ok(())
}

fn print_state_text(state: &State, profile: &Profile, short: bool, time: Option<(String, bool)>) {
    let width = profile.field_width();
    let vd = profile.voltage_decimals();
    let id = profile.current_decimals();

    match time {
        Some((time, true)) => println!("time = {time} UTC"),
        Some((time, false)) => println!("time = {time}"),
        None => {}
    }
    if !short {
        print!(
            "Vin  = {:7.2} v    tempin = {:>2} 'c",
            state.voltage_in, state.internal_temperature
        );
        if state.battery.is_some() {
            match state.external_temperature {
                Some(temperature) => println!("    tempext = {temperature:>2} 'c"),
                None => println!("    tempext = (disconnected)"),
            }
        } else {
            println!();
        }
        print!("Vset = {:width$.vd$} v", state.voltage_set);
        match state.over_voltage_protection {
            Some(ovp) => println!("    OVP = {ovp:width$.vd$} v"),
            None => println!(),
        }
        print!("Iset = {:width$.id$} a", state.current_set);
        match state.over_current_protection {
            Some(ocp) => println!("    OCP = {ocp:width$.id$} a"),
            None => println!(),
        }
    }
    if state.output {
        println!("OUTPUT ENABLED");
    } else {
        println!("OUTPUT DISABLED");
    }
    if state.constant_current {
        println!("CURRENT MODE");
    }
    if state.protection_tripped {
        println!("OVP_OCP PROTECTION ACTIVE");
    }
    if let Some(battery) = &state.battery {
        println!("Vbat = {:width$.vd$} v", battery.voltage);
    }
    println!("Vout = {:width$.vd$} v", state.voltage_out);
    println!("Iout = {:width$.id$} a", state.current_out);
    if !short {
        println!("Pout = {:width$.2} w", state.power_out);
        if let Some(battery) = &state.battery {
            println!("Ahour = {} Ah", battery.amp_hours);
            println!("Whour = {} Wh", battery.watt_hours);
        }
    }
}

fn print_state<T: Transport>(
    client: &mut Rd60xx<T>,
    json: bool,
    short: bool,
    time: bool,
    utc: bool,
) -> Result<()> {
    let state = client.state().context("Cannot read state")?;
    let profile = client.profile()?;
    let time = (time || utc).then(|| timestamp(utc));
    if json {
        print_state_json(&state, short, time)
    } else {
        print_state_text(&state, &profile, short, time.map(|t| (t, utc)));
        Ok(())
    }
}

fn query<T: Transport>(client: &mut Rd60xx<T>, quantity: Quantity) -> Result<String> {
    client.sync(false).context("Cannot read state")?;
    let profile = client.profile()?;
    let volts = profile.voltage_scale() as f64;
    let amps = profile.current_scale() as f64;
    let mut get = |address: u16| {
        client
            .read_register(address, false)
            .with_context(|| format!("Cannot read register {address}"))
    };
    Ok(match quantity {
        Quantity::Voltage => (get(addr::V_OUT)? as f64 / volts).to_string(),
        Quantity::Current => (get(addr::I_OUT)? as f64 / amps).to_string(),
        Quantity::BatteryVoltage => (get(addr::V_BAT)? as f64 / volts).to_string(),
        Quantity::Millivolts => ((1000.0 * get(addr::V_OUT)? as f64 / volts) as i64).to_string(),
        Quantity::Milliamps => ((1000.0 * get(addr::I_OUT)? as f64 / amps) as i64).to_string(),
        Quantity::InternalTemp => get(addr::INT_C)?.to_string(),
        Quantity::ExternalTemp => get(addr::EXT_C)?.to_string(),
    })
}

fn apply_set_value<T: Transport>(
    client: &mut Rd60xx<T>,
    name: &str,
    set_value: Option<SetValue>,
    setter: fn(&mut Rd60xx<T>, f64, bool) -> rd60xx_lib::Result<()>,
) -> Result<()> {
    if let Some(SetValue { value, relative }) = set_value {
        info!("Setting {name} to {}{value}", if relative { "current value " } else { "" });
        setter(client, value, relative).with_context(|| format!("Cannot set {name} to {value}"))?;
    }
    Ok(())
}

fn confirm_calibration_write(register: &RegisterRef, address: u16) -> Result<bool> {
    println!(
        "WARNING: Register {register} ({address}) holds calibration data. \
         A wrong value ruins the accuracy of the power supply."
    );
    Confirm::new()
        .with_prompt("Do you really want to write it?")
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")
}

fn execute<T: Transport>(client: &mut Rd60xx<T>, command: &CliCommands) -> Result<()> {
    match command {
        CliCommands::State {
            json,
            short,
            time,
            utc,
        } => {
            info!("Executing: State");
            print_state(client, *json, *short, *time, *utc)?;
        }
        CliCommands::Query { quantity } => {
            info!("Executing: Query {quantity:?}");
            println!("{}", query(client, *quantity)?);
        }
        CliCommands::Get { registers } => {
            info!("Executing: Get registers");
            client.sync(false).context("Cannot read state")?;
            for register in registers {
                let value = client
                    .read_register(register.clone(), false)
                    .with_context(|| format!("Cannot read register {register}"))?;
                println!("{register} = {value}");
            }
        }
        CliCommands::Set {
            voltage,
            current,
            ovp,
            ocp,
            on,
            off,
        } => {
            info!("Executing: Set");
            apply_set_value(client, "voltage", *voltage, Rd60xx::set_voltage)?;
            apply_set_value(client, "current", *current, Rd60xx::set_current)?;
            apply_set_value(client, "OVP", *ovp, Rd60xx::set_over_voltage_protection)?;
            apply_set_value(client, "OCP", *ocp, Rd60xx::set_over_current_protection)?;
            if *on || *off {
                client
                    .write_register(addr::OUTPUT, u16::from(*on), WriteMode::Cached)
                    .context("Cannot switch output")?;
            }
            client.sync(false).context("Cannot write settings")?;
        }
        CliCommands::On => {
            info!("Executing: Output on");
            client.set_output_enabled(true).context("Cannot enable output")?;
        }
        CliCommands::Off => {
            info!("Executing: Output off");
            client.set_output_enabled(false).context("Cannot disable output")?;
        }
        CliCommands::Toggle => {
            info!("Executing: Toggle output");
            let enabled = client.toggle_output().context("Cannot toggle output")?;
            println!("OUTPUT {}", if enabled { "ENABLED" } else { "DISABLED" });
        }
        CliCommands::WriteReg {
            register,
            value,
            yes,
        } => {
            let address = register.resolve()?;
            info!("Executing: Write register {register} ({address}) = {value}");
            if registers::is_calibration(address)
                && !yes
                && !confirm_calibration_write(register, address)?
            {
                info!("Register write aborted by user.");
                return Ok(());
            }
            println!("REGISTER WRITE: {address} = {value}");
            client
                .write_register(address, *value, WriteMode::Immediate)
                .with_context(|| format!("Cannot write register {register}"))?;
        }
        CliCommands::Regs { all, count } => {
            let count = match (all, count) {
                (true, _) => ALL_REGISTER_COUNT,
                (false, Some(count)) => *count,
                (false, None) => STATE_REGISTER_COUNT,
            };
            info!("Executing: Dump {count} registers");
            if count == 0 {
                bail!("Register count must be at least 1");
            }
            client.sync(false).context("Cannot read state")?;
            let values = client
                .read_registers(0u16, count)
                .context("Cannot read registers")?;
            let force = *all || count != STATE_REGISTER_COUNT;
            for (address, value) in values.into_iter().enumerate() {
                print_register(address as u16, value, force);
            }
        }
        CliCommands::Presets => {
            info!("Executing: Print presets");
            let profile = client.profile()?;
            let volts = profile.voltage_scale() as f64;
            let amps = profile.current_scale() as f64;
            let presets = client.read_presets().context("Cannot read presets")?;
            println!("PRESETS:");
            for (index, preset) in presets.iter().enumerate() {
                println!(
                    "M{index}: {:>6} v  {:>6} a  {:>6} v ovp  {:>6} a ocp",
                    preset.voltage as f64 / volts,
                    preset.current as f64 / amps,
                    preset.over_voltage as f64 / volts,
                    preset.over_current as f64 / amps
                );
            }
            let active = client
                .read_register(addr::PRESET, false)
                .context("Cannot read active preset")?;
            println!("Current: {active}");
        }
        CliCommands::SetPreset {
            index,
            voltage,
            current,
            ovp,
            ocp,
        } => {
            info!("Executing: Set preset M{index}");
            let stored = client
                .write_preset_values(*index, [*voltage, *current, *ovp, *ocp])
                .with_context(|| format!("Cannot write preset M{index}"))?;
            println!("M{index} stored: {stored:?}");
        }
        CliCommands::SetClock => {
            info!("Executing: Set clock");
            let time = client.sync_clock().context("Cannot set clock")?;
            println!("Clock set to {time}");
        }
        CliCommands::Type => {
            info!("Executing: Print device type");
            let info = client.device_info().context("Cannot read device type")?;
            let profile = client.profile()?;
            println!("{info}");
            println!("{profile}");
        }
        CliCommands::Watch {
            interval,
            count,
            diff,
        } => {
            info!("Executing: Watch every {interval:?}, diff={diff}");
            let mut polls = 0u64;
            loop {
                if *diff {
                    client.sync(true).context("Cannot read state")?;
                    let changes = client.changes().context("Cannot compare registers")?;
                    if !changes.is_empty() {
                        print_changes(&changes);
                    }
                    client.save_snapshot();
                } else {
                    print_state(client, false, false, true, false)?;
                    println!();
                }
                polls += 1;
                if count.is_some_and(|count| polls >= count) {
                    break;
                }
                std::thread::sleep(*interval);
            }
        }
        CliCommands::ConfigTemplate => unreachable!("ConfigTemplate is handled before connecting."),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "rd60 CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Commands without a device
    if args.command == CliCommands::ConfigTemplate {
        print!("{TEMPLATE}");
        return Ok(());
    }

    // 3. Setup the client
    let config = load_config(&args)?;
    let mut client = config.connect().context("Cannot create client")?;

    // 4. Execute the command
    let result = execute(&mut client, &args.command);
    if result.is_err() {
        let discarded = client.discard_pending_writes();
        if discarded > 0 {
            warn!("Command failed, {discarded} pending writes not sent");
        }
    }
    client.close();

    if let Err(error) = &result {
        if let Some(fatal) = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<rd60xx_lib::Error>())
            .filter(|cause| cause.is_fatal())
        {
            error!("{error:#}");
            eprintln!("Error: {error:#}");
            std::process::exit(fatal.exit_code());
        }
    }
    result
}
