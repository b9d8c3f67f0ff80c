use crate::labels;
use crate::CoreError;
use ddb_engine::{ContainerEngine, ImageRecord};
use tracing::debug;

/// Find a cached image provisioned for `dist` by the current schema version.
///
/// A miss is `Ok(None)`. With several matches the newest one wins; equally old
/// matches keep the engine's listing order.
pub fn find_image(
    engine: &dyn ContainerEngine,
    dist: &str,
) -> Result<Option<ImageRecord>, CoreError> {
    let found = engine
        .list_images()?
        .into_iter()
        .filter(|image| labels::matches(&image.labels, dist))
        .fold(None, |best: Option<ImageRecord>, image| match best {
            Some(best) if best.created >= image.created => Some(best),
            _ => Some(image),
        });

    match &found {
        Some(image) => debug!("cache hit for {dist}: {}", image.id),
        None => debug!("no cached image for {dist}"),
    }
    Ok(found)
}
