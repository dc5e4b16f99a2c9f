// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, deadline_exceeded_error,
                      failed_precondition_error, invalid_argument_error,
                      unavailable_error};
use log::{debug, info, warn};
use nix::sys::termios::{BaudRate, SetArg, SpecialCharacterIndices, cfmakeraw,
                        cfsetspeed, tcflush, tcgetattr, tcsetattr, FlushArg};
use tokio::runtime::{Handle, RuntimeFlavor};

use interval_elements::hardware_trait::{FixQuality, GpsFix, HardwareTrait,
                                        Location, TriggerMode};

// Reads give up after this many tenths of a second without a byte.
const READ_TIMEOUT_DECISECONDS: u8 = 50;

const READY_POLL: Duration = Duration::from_millis(500);

// Longest exposure the camera might still be finishing.
const READY_TIMEOUT: Duration = Duration::from_secs(120);

// Runs `work`, which may block for a long time. On a multi-threaded tokio
// runtime the worker thread is handed over to the blocking section first so
// other tasks keep running.
fn run_blocking<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread =>
            tokio::task::block_in_place(work),
        _ => work(),
    }
}

// Opens `device` as a raw 115200 baud tty with a read timeout.
fn open_tty(device: &Path) -> Result<File, CanonicalError> {
    let file = OpenOptions::new().read(true).write(true).open(device).map_err(|e| {
        unavailable_error(format!("open {:?}: {:?}", device, e).as_str())
    })?;
    let tty_error = |what: &str, e: nix::Error| {
        failed_precondition_error(format!("{} {:?}: {}", what, device, e).as_str())
    };
    let mut termios = tcgetattr(&file).map_err(|e| tty_error("tcgetattr", e))?;
    cfmakeraw(&mut termios);
    cfsetspeed(&mut termios, BaudRate::B115200).map_err(|e| tty_error("cfsetspeed", e))?;
    termios.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    termios.control_chars[SpecialCharacterIndices::VTIME as usize] =
        READ_TIMEOUT_DECISECONDS;
    tcsetattr(&file, SetArg::TCSANOW, &termios).map_err(|e| tty_error("tcsetattr", e))?;
    tcflush(&file, FlushArg::TCIOFLUSH).map_err(|e| tty_error("tcflush", e))?;
    Ok(file)
}

fn parse_quality(s: &str) -> Result<FixQuality, CanonicalError> {
    match s {
        "N" => Ok(FixQuality::NoLock),
        "2D" => Ok(FixQuality::Fix2d),
        "3D" => Ok(FixQuality::Fix3d),
        _ => Err(invalid_argument_error(format!("fix quality {:?}", s).as_str())),
    }
}

// Parses a "<lon> <lat> <altitude> <quality>" GPS reply.
fn parse_gps(reply: &str, current: Location) -> Result<GpsFix, CanonicalError> {
    let fields: Vec<&str> = reply.split_whitespace().collect();
    let &[lon, lat, altitude, quality] = &fields[..] else {
        return Err(invalid_argument_error(format!("gps reply {:?}", reply).as_str()));
    };
    let quality = parse_quality(quality)?;
    if quality == FixQuality::NoLock {
        return Ok(GpsFix{location: current, quality});
    }
    let number = |s: &str| s.parse::<f64>().map_err(|e| invalid_argument_error(
        format!("gps field {:?}: {}", s, e).as_str()));
    Ok(GpsFix{location: Location{lon: number(lon)?, lat: number(lat)?,
                                 altitude: number(altitude)?},
              quality})
}

/// Driver for the station microcontroller. Commands are single text lines;
/// each is answered by one line starting with "OK" (optionally followed by
/// a value) or "ERR" and a reason.
pub struct SerialController {
    reader: Box<dyn BufRead + Send>,
    writer: Box<dyn Write + Send>,
    closed: bool,
}

impl SerialController {
    pub fn open(device: &Path) -> Result<Self, CanonicalError> {
        let tty = open_tty(device)?;
        let writer = tty.try_clone().map_err(|e| {
            failed_precondition_error(format!("clone {:?}: {:?}", device, e).as_str())
        })?;
        info!("serial_connected, {}", device.display());
        Ok(Self::from_streams(Box::new(BufReader::new(tty)), Box::new(writer)))
    }

    pub fn from_streams(reader: Box<dyn BufRead + Send>,
                        writer: Box<dyn Write + Send>) -> Self {
        SerialController{reader, writer, closed: false}
    }

    // Sends `command` and returns the text following "OK".
    fn command(&mut self, command: &str) -> Result<String, CanonicalError> {
        if self.closed {
            return Err(failed_precondition_error("serial channel closed"));
        }
        let io_error = |e: std::io::Error| unavailable_error(
            format!("serial {:?}: {:?}", command, e).as_str());
        writeln!(self.writer, "{}", command).map_err(io_error)?;
        self.writer.flush().map_err(io_error)?;
        let mut line = String::new();
        if self.reader.read_line(&mut line).map_err(io_error)? == 0 {
            return Err(deadline_exceeded_error(
                format!("no reply to {:?}", command).as_str()));
        }
        let line = line.trim();
        debug!("serial, {}, {}", command, line);
        if let Some(rest) = line.strip_prefix("OK") {
            return Ok(rest.trim().to_string());
        }
        Err(failed_precondition_error(
            format!("{:?} refused: {:?}", command, line).as_str()))
    }

    fn switch(&mut self, what: &str, on: bool) -> Result<(), CanonicalError> {
        self.command(&format!("{} {}", what, if on { 1 } else { 0 })).map(|_| ())
    }
}

impl HardwareTrait for SerialController {
    fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<(), CanonicalError> {
        self.switch("BULB", mode == TriggerMode::Bulb)
    }

    fn shutter_on(&mut self) -> Result<(), CanonicalError> {
        self.switch("SHUTTER", true)
    }

    fn shutter_off(&mut self) -> Result<(), CanonicalError> {
        self.switch("SHUTTER", false)
    }

    fn single_exposure(&mut self) -> Result<(), CanonicalError> {
        self.command("EXPOSE").map(|_| ())
    }

    fn camera_on(&mut self) -> Result<(), CanonicalError> {
        self.switch("CAMERA", true)
    }

    fn camera_off(&mut self) -> Result<(), CanonicalError> {
        self.switch("CAMERA", false)
    }

    fn video_on(&mut self) -> Result<(), CanonicalError> {
        self.switch("VIDEO", true)
    }

    fn video_off(&mut self) -> Result<(), CanonicalError> {
        self.switch("VIDEO", false)
    }

    fn fan_on(&mut self) -> Result<(), CanonicalError> {
        self.switch("FAN", true)
    }

    fn fan_off(&mut self) -> Result<(), CanonicalError> {
        self.switch("FAN", false)
    }

    fn heater_on(&mut self, temperature_c: f64) -> Result<(), CanonicalError> {
        self.command(&format!("HEATER {:.1}", temperature_c)).map(|_| ())
    }

    fn wait_until_ready(&mut self) -> Result<(), CanonicalError> {
        run_blocking(|| {
            let deadline = Instant::now() + READY_TIMEOUT;
            loop {
                if self.command("BUSY?")? == "0" {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    return Err(deadline_exceeded_error("camera still busy"));
                }
                thread::sleep(READY_POLL);
            }
        })
    }

    fn temperature(&mut self) -> Result<f64, CanonicalError> {
        let reply = self.command("TEMP?")?;
        reply.parse().map_err(|e| invalid_argument_error(
            format!("temperature {:?}: {}", reply, e).as_str()))
    }

    fn firmware_version(&mut self) -> Result<String, CanonicalError> {
        self.command("VERSION?")
    }

    fn sequence(&mut self) -> Result<String, CanonicalError> {
        self.command("SEQ?")
    }

    fn debug_codes(&mut self) -> Result<String, CanonicalError> {
        self.command("DEBUG?")
    }

    fn update_gps_location(&mut self, current: Location)
                           -> Result<GpsFix, CanonicalError> {
        let reply = self.command("GPS?")?;
        parse_gps(&reply, current)
    }

    fn close(&mut self) -> Result<(), CanonicalError> {
        if self.closed {
            return Err(failed_precondition_error("serial channel already closed"));
        }
        if let Err(e) = self.writer.flush() {
            warn!("serial_flush_failed, {:?}", e);
        }
        self.closed = true;
        info!("serial_closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use approx::assert_abs_diff_eq;
    use super::*;

    // Captures what the driver writes.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn controller(replies: &str) -> (SerialController, SharedBuf) {
        let sent = SharedBuf::default();
        let reader = Box::new(Cursor::new(replies.as_bytes().to_vec()));
        (SerialController::from_streams(reader, Box::new(sent.clone())), sent)
    }

    fn sent_lines(sent: &SharedBuf) -> Vec<String> {
        String::from_utf8(sent.0.lock().unwrap().clone()).unwrap()
            .lines().map(str::to_string).collect()
    }

    #[test]
    fn test_commands() {
        let (mut hw, sent) = controller("OK\nOK\nOK 21.5\nERR busy\n");
        hw.shutter_on().unwrap();
        hw.set_trigger_mode(TriggerMode::NonBulb).unwrap();
        assert_abs_diff_eq!(hw.temperature().unwrap(), 21.5);
        assert!(hw.camera_on().is_err());
        // Out of replies.
        assert!(hw.fan_on().is_err());
        assert_eq!(sent_lines(&sent),
                   vec!["SHUTTER 1", "BULB 0", "TEMP?", "CAMERA 1", "FAN 1"]);
    }

    #[test]
    fn test_wait_until_ready_polls() {
        let (mut hw, sent) = controller("OK 1\nOK 0\n");
        hw.wait_until_ready().unwrap();
        assert_eq!(sent_lines(&sent), vec!["BUSY?", "BUSY?"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_wait_until_ready_leaves_runtime_responsive() {
        let (mut hw, sent) = controller("OK 1\nOK 1\nOK 0\n");
        let ticker = tokio::spawn(async {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
        // Occupies the only worker for two 500 ms polls.
        let waiter = tokio::spawn(async move { hw.wait_until_ready() });
        waiter.await.unwrap().unwrap();
        assert!(ticker.is_finished());
        assert_eq!(sent_lines(&sent).len(), 3);
    }

    #[test]
    fn test_gps() {
        let current = Location{lon: 115.0, lat: -31.0, altitude: 10.0};
        let (mut hw, _) = controller("OK 116.5 -32.25 250.0 3D\nOK 0 0 0 N\nOK junk\n");
        let fix = hw.update_gps_location(current).unwrap();
        assert_eq!(fix.quality, FixQuality::Fix3d);
        assert_abs_diff_eq!(fix.location.lat, -32.25);
        let fix = hw.update_gps_location(current).unwrap();
        assert_eq!(fix, GpsFix{location: current, quality: FixQuality::NoLock});
        assert!(hw.update_gps_location(current).is_err());
    }

    #[test]
    fn test_close_is_final() {
        let (mut hw, _) = controller("OK\n");
        hw.close().unwrap();
        assert!(hw.close().is_err());
        assert!(hw.shutter_off().is_err());
    }

}  // mod tests.
