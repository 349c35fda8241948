//! RGB streaming CLI
//!
//! Device drivers for two lighting protocols: the Philips Hue Entertainment
//! streaming mode (DTLS-PSK over UDP, documented at
//! https://developers.meethue.com/develop/hue-entertainment/) and the
//! Logitech G915 keyboard's HID++ lighting features.

use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::io::{self, Write};
use std::num::ParseIntError;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use clap::builder::EnumValueParser;
use clap::{
    crate_description, crate_name, crate_version, Arg, ArgAction, ArgMatches, Command, ValueEnum,
};
use hidapi::HidApi;

use crate::driver::RgbDriver;
use crate::hue_bridge::HueBridge;
use crate::hue_entertainment::{DtlsChannel, EntertainmentSession};
use crate::logitech_g915::{
    G915Controller, G915_PID_RECEIVER, G915_PID_WIRED, LOGITECH_VID, SPEED_FASTEST, SPEED_NORMAL,
    SPEED_SLOWEST,
};

mod driver;
mod hue_bridge;
mod hue_entertainment;
mod logitech_g915;

/// Lighting mode for mode-based devices.
#[derive(ValueEnum, Default, PartialEq, Eq, Debug, Copy, Clone)]
pub(crate) enum Mode {
    Off,
    #[default]
    Static,
    Breathing,
    Cycle,
    Wave,
    Direct,
}

/// RGB color.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl FromStr for Rgb {
    type Err = ();

    fn from_str(s: &str) -> Result<Rgb, ()> {
        let chars = match s.strip_prefix("0x") {
            Some(chars) if chars.len() == 6 => chars,
            _ => return Err(()),
        };

        let color = u32::from_str_radix(chars, 16).map_err(|_| ())?;
        Ok(Rgb {
            r: (color >> 16) as u8,
            g: (color >> 8 & 0xff) as u8,
            b: (color & 0xff) as u8,
        })
    }
}

impl Display for Rgb {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Effect speed; smaller is faster.
#[derive(PartialEq, Eq, Copy, Clone)]
struct Speed(u16);

impl Default for Speed {
    fn default() -> Self {
        Self(SPEED_NORMAL)
    }
}

impl FromStr for Speed {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "slowest" => Ok(Speed(SPEED_SLOWEST)),
            "normal" => Ok(Speed(SPEED_NORMAL)),
            "fastest" => Ok(Speed(SPEED_FASTEST)),
            _ => Ok(Speed(u16::from_str(s)?)),
        }
    }
}

fn main() {
    let cli = cli();

    let result = match cli.subcommand() {
        Some(("hue", matches)) => hue(matches),
        Some(("g915", matches)) => g915(matches),
        _ => Err("no subcommand given".into()),
    };

    match result {
        Ok(()) => println!("\x1b[32mSuccessfully applied changes.\x1b[0m"),
        Err(err) => eprintln!("\x1b[31mError:\x1b[0m {err}"),
    }
}

/// Stream a color to a Hue Entertainment group.
fn hue(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let group_id = required_string(matches, "group");
    let color: Rgb = required_color(matches);

    let mut hold = 5u64;
    replace_from_str(&mut hold, matches, "hold");

    let bridge = HueBridge::new(
        &required_string(matches, "bridge"),
        &required_string(matches, "username"),
        &required_string(matches, "client-key"),
    )?;
    let topology = bridge.group(&group_id)?;

    println!(
        "Streaming {} to group '{}' ({} lights)...",
        color,
        topology.name,
        topology.light_ids.len()
    );

    // The streaming credentials come off the bridge handle; it moves into
    // the session while the channel closure still needs them.
    let ip = bridge.ip().to_string();
    let username = bridge.username().to_string();
    let client_key = bridge.client_key().to_string();

    let mut session = EntertainmentSession::new(bridge, topology, &ip, || {
        DtlsChannel::connect(&ip, &username, &client_key)
    })?;
    print_driver_info(&session);

    let colors = vec![color; session.led_count()];
    session.set_color(&colors);

    // Keep the stream open; dropping the session reverts the group to its
    // pre-streaming state.
    thread::sleep(Duration::from_secs(hold));

    println!("Closing stream to '{}'.", session.group_name());
    Ok(())
}

/// Apply a lighting mode to a Logitech G915 keyboard.
fn g915(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let wired = !matches.get_flag("wireless");
    let mode = *required_enum::<Mode>(matches, "mode");

    let mut speed = Speed::default();
    replace_from_str(&mut speed, matches, "speed");

    // Color channels stay zeroed for modes that do not take a color.
    let color = match mode {
        Mode::Off | Mode::Cycle | Mode::Wave => Rgb::default(),
        _ => required_color(matches),
    };

    let api = HidApi::new()?;
    let pid = if wired { G915_PID_WIRED } else { G915_PID_RECEIVER };
    let device = match api.open(LOGITECH_VID, pid) {
        Ok(device) => device,
        Err(err) => {
            return Err(format!("unable to open device: {err} (root permissions required)").into())
        },
    };

    let mut controller = G915Controller::new(device, wired)?;
    print_driver_info(&controller);

    if let Some(Ok(brightness)) = cli_from_str::<u8>(matches, "brightness") {
        controller.set_brightness(brightness);
    }

    // Latency-sensitive single-key path: skip the full-frame redraw.
    if let Some(Ok(keycode)) = cli_from_str::<u8>(matches, "key") {
        controller.send_single_led(keycode, color);
        controller.commit();
        return Ok(());
    }

    if mode == Mode::Direct {
        controller.initialize_direct();
        let colors = vec![color; controller.led_count()];
        controller.set_color(&colors);
    } else {
        controller.set_mode(mode, speed.0, color);
        controller.commit();
    }

    Ok(())
}

/// Get clap CLI parameters.
fn cli() -> ArgMatches {
    Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .subcommand_required(true)
        .subcommand(
            Command::new("hue")
                .about("Stream a color to a Hue Entertainment group")
                .arg(Arg::new("bridge").help("Bridge IP address").long("bridge").required(true))
                .arg(
                    Arg::new("username")
                        .help("Whitelisted bridge username")
                        .long("username")
                        .required(true),
                )
                .arg(
                    Arg::new("client-key")
                        .help("Entertainment client key (hex)")
                        .long("client-key")
                        .required(true),
                )
                .arg(
                    Arg::new("group")
                        .help("Entertainment group ID")
                        .long("group")
                        .short('g')
                        .required(true),
                )
                .arg(Arg::new("color").help("LED color in RGB [0xRRGGBB]").long("color").short('c'))
                .arg(Arg::new("hold").help("Seconds to keep the stream open").long("hold")),
        )
        .subcommand(
            Command::new("g915")
                .about("Apply a lighting mode to a Logitech G915 keyboard")
                .arg(
                    Arg::new("mode")
                        .help("Lighting mode")
                        .long("mode")
                        .short('m')
                        .ignore_case(true)
                        .value_parser(EnumValueParser::<Mode>::new()),
                )
                .arg(Arg::new("color").help("LED color in RGB [0xRRGGBB]").long("color").short('c'))
                .arg(
                    Arg::new("speed")
                        .help("Effect speed [slowest|normal|fastest|<u16>], smaller is faster")
                        .long("speed")
                        .short('s'),
                )
                .arg(
                    Arg::new("brightness")
                        .help("Lighting brightness [possible values: 0..=255]")
                        .long("brightness")
                        .short('b'),
                )
                .arg(
                    Arg::new("key")
                        .help("Update a single key by HID keycode instead of whole zones")
                        .long("key")
                        .short('k'),
                )
                .arg(
                    Arg::new("wireless")
                        .help("Address the keyboard through the LIGHTSPEED receiver")
                        .long("wireless")
                        .action(ArgAction::SetTrue),
                ),
        )
        .get_matches()
}

/// Print a connected driver's identity block.
fn print_driver_info(driver: &dyn RgbDriver) {
    println!("Device:   {} ({})", driver.name(), driver.location());

    let optional = [
        ("Version", driver.version()),
        ("Vendor", driver.manufacturer()),
        ("Serial", driver.unique_id()),
    ];
    for (label, value) in optional {
        if !value.is_empty() {
            println!("{label}:   {value}");
        }
    }

    println!("LEDs:     {}", driver.led_count());
}

/// Read a required string argument; clap enforces presence.
fn required_string(matches: &ArgMatches, name: &str) -> String {
    matches.get_one::<String>(name).cloned().unwrap_or_default()
}

/// Convert a CLI option from the parameter string.
#[inline]
fn cli_from_str<T>(matches: &ArgMatches, name: &str) -> Option<Result<T, <T as FromStr>::Err>>
where
    T: FromStr,
{
    matches.get_one::<String>(name).map(|value| T::from_str(value))
}

/// Replace a value with the CLI parameter if it is present.
#[inline]
fn replace_from_str<T: FromStr>(option: &mut T, matches: &ArgMatches, name: &str) {
    if let Some(Ok(value)) = cli_from_str(matches, name) {
        *option = value;
    }
}

/// Read the color option from CLI or prompt for STDIN if not present.
fn required_color(matches: &ArgMatches) -> Rgb {
    match cli_from_str(matches, "color") {
        Some(Ok(value)) => return value,
        Some(Err(_)) => eprintln!("\x1b[31mInvalid CLI color parameter.\x1b[0m\n"),
        _ => (),
    }

    loop {
        print!("Please select a color (format: 0xRRGGBB):\n > ");
        let _ = io::stdout().flush();

        let input = stdin_nextline();

        match Rgb::from_str(&input) {
            Ok(value) => {
                println!();
                break value;
            },
            Err(_) => eprintln!(
                "\x1b[31mColor '{input}' does not match format 0xRRGGBB, please try again.\x1b[0m\n"
            ),
        }
    }
}

/// Read an enum option from CLI or prompt for STDIN if not present.
fn required_enum<'a, T>(matches: &'a ArgMatches, name: &str) -> &'a T
where
    T: ValueEnum + Debug + Copy + Sync + Send + 'static,
{
    if let Some(value) = matches.get_one::<T>(name) {
        return value;
    }

    loop {
        // Offer all available variants.
        println!("[{name}] Please select a number:");
        let variants = T::value_variants();
        for (i, variant) in variants.iter().enumerate() {
            println!("  [{i}] {variant:?}");
        }
        print!(" > ");
        let _ = io::stdout().flush();

        let input = stdin_nextline();

        match usize::from_str(&input).ok().and_then(|index| variants.get(index)) {
            Some(variant) => {
                println!();
                return variant;
            },
            _ => println!("\x1b[31mVariant '{input}' does not exist, please try again.\x1b[0m\n"),
        }
    }
}

/// Read next line from STDIN.
#[inline]
fn stdin_nextline() -> String {
    let mut input = String::new();

    let _ = io::stdin().read_line(&mut input);

    input.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_parses_hex_triplets() {
        assert_eq!(Rgb::from_str("0xff8001"), Ok(Rgb { r: 0xff, g: 0x80, b: 0x01 }));
        assert_eq!(Rgb::from_str("ff8001"), Err(()));
        assert_eq!(Rgb::from_str("0xff80"), Err(()));
        assert_eq!(Rgb::from_str("0xzzzzzz"), Err(()));
    }

    #[test]
    fn rgb_displays_as_hex() {
        let color = Rgb { r: 0x01, g: 0xab, b: 0xff };
        assert_eq!(color.to_string(), "0x01abff");
    }

    #[test]
    fn speed_accepts_names_and_numbers() {
        assert_eq!(Speed::from_str("slowest").unwrap().0, SPEED_SLOWEST);
        assert_eq!(Speed::from_str("normal").unwrap().0, SPEED_NORMAL);
        assert_eq!(Speed::from_str("fastest").unwrap().0, SPEED_FASTEST);
        assert_eq!(Speed::from_str("500").unwrap().0, 500);
        assert!(Speed::from_str("quick").is_err());
    }
}
