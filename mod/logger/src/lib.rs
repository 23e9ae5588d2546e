//! Loaded into the browser. The `parseFloat` trampolines call the `GRAPPLE_*` exports with a
//! pointer to whatever follows the marker, and everything ends up in a per-session log file.

use std::fs;
use std::io;
use std::env;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};

use grapple::dll;
use grapple::logging;
use grapple::signal::codec;
use grapple::signal::{Marker, Recorder};

const LOG_DIRECTORY_VARIABLE: &str = "GRAPPLE_LOG_DIR";
const DEFAULT_LOG_DIRECTORY: &str = "log/sessions";

static RECORDER: Mutex<Option<Recorder<fs::File>>> = Mutex::new(None);

#[dll::entrypoint(detach = shutdown)]
pub fn entry(_: usize) -> bool {
    if let Err(e) = logging::init("log/grapple_logger.log") {
        eprintln!("Could not set up logging: {:?}", e);
    }

    info!("Logger loaded, sessions go to {}", log_directory().display());
    true
}

fn shutdown() {
    let mut recorder = match RECORDER.lock() {
        Ok(r) => r,
        Err(poisoned) => poisoned.into_inner(),
    };

    if let Some(mut recorder) = recorder.take() {
        if let Err(e) = recorder.flush() {
            error!("Could not flush the session log: {}", e);
        }
    }
}

#[no_mangle]
pub extern "C" fn GRAPPLE_startingTest(payload: *const u16) {
    handle(Marker::SessionOpen, payload)
}

#[no_mangle]
pub extern "C" fn GRAPPLE_logMessage(payload: *const u16) {
    handle(Marker::LogEntry, payload)
}

#[no_mangle]
pub extern "C" fn GRAPPLE_finishedTest(payload: *const u16) {
    handle(Marker::TestComplete, payload)
}

fn handle(marker: Marker, payload: *const u16) {
    let units = match unsafe { codec::read_terminated(marker, payload, codec::DEFAULT_LENGTH_GUARD) } {
        Ok(units) => units,
        Err(e) => {
            warn!("Dropping {}: {}", marker, e);
            return;
        },
    };

    let mut recorder = match RECORDER.lock() {
        Ok(r) => r,
        Err(poisoned) => poisoned.into_inner(),
    };

    if marker == Marker::SessionOpen {
        match open_session_log() {
            Ok((path, file)) => {
                debug!("Recording session into {}", path.display());
                *recorder = Some(Recorder::new(file));
            },
            Err(e) => {
                error!("Could not create a session log: {}", e);
                *recorder = None;
            },
        }
    }

    let Some(recorder) = recorder.as_mut() else {
        warn!("Dropping {} without an open session", marker);
        return;
    };

    if let Err(e) = recorder.record_units(marker, &units) {
        error!("Could not write {}: {}", marker, e);
    }
}

fn log_directory() -> PathBuf {
    env::var_os(LOG_DIRECTORY_VARIABLE)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIRECTORY))
}

fn open_session_log() -> io::Result<(PathBuf, fs::File)> {
    let directory = log_directory();
    fs::create_dir_all(&directory)?;

    let started = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();

    let path = directory.join(format!("session-{}-{}.xml", std::process::id(), started));
    let file = fs::File::create(&path)?;

    Ok((path, file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(text: &str) -> Vec<u16> {
        text.encode_utf16().chain(std::iter::once(codec::TERMINATOR)).collect()
    }

    #[test]
    fn we_can_record_a_session_through_the_exports() {
        let directory = env::temp_dir().join(format!("grapple-logger-{}", std::process::id()));
        env::set_var(LOG_DIRECTORY_VARIABLE, &directory);

        let open = units("<fuzzer name=\"smoke\" browser=\"CM\">");
        let entry = units("<log><idx>0</idx><location></location><message>a()</message><count>1</count></log>");
        let close = units("</fuzzer>");

        GRAPPLE_logMessage(entry.as_ptr());
        GRAPPLE_startingTest(open.as_ptr());
        GRAPPLE_logMessage(entry.as_ptr());
        GRAPPLE_finishedTest(close.as_ptr());
        shutdown();

        let logs = fs::read_dir(&directory).unwrap()
            .map(|e| e.unwrap().path())
            .collect::<Vec<_>>();
        assert_eq!(logs.len(), 1);

        let contents = fs::read_to_string(&logs[0]).unwrap();
        assert_eq!(
            contents,
            "<fuzzer name=\"smoke\" browser=\"CM\">\n\
             <log><idx>0</idx><location></location><message>a()</message><count>1</count></log>\n\
             </fuzzer>\n"
        );

        let _ = fs::remove_dir_all(directory);
    }

    #[test]
    fn null_payloads_are_dropped() {
        GRAPPLE_logMessage(std::ptr::null());
    }
}
