use super::{json_pretty, spin_finish, spinner, EXIT_SUCCESS};
use ddb_core::Session;
use ddb_engine::ContainerEngine;

pub fn run(engine: &dyn ContainerEngine, json: bool) -> Result<u8, String> {
    if json {
        let report = Session::new(engine)
            .with_notifier(|_| {})
            .clean()
            .map_err(|e| e.to_string())?;
        println!("{}", json_pretty(&report)?);
        return Ok(EXIT_SUCCESS);
    }

    let pb = spinner("Cleaning up old images...")?;
    let session = Session::new(engine).with_notifier(|msg| pb.set_message(msg.to_owned()));
    let report = match session.clean() {
        Ok(report) => {
            spin_finish(&pb, true, "cleanup finished");
            report
        }
        Err(e) => {
            spin_finish(&pb, false, "cleanup failed");
            return Err(e.to_string());
        }
    };

    if report.cleaned() {
        println!("Success!");
    } else {
        println!("No images to clean were found.");
    }
    Ok(EXIT_SUCCESS)
}
