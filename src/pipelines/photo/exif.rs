// SPDX-License-Identifier: GPL-3.0-only

//! EXIF tags for captured stills
//!
//! The still encoder embeds `key=value` tags set on its output port before
//! capture. The built-in camera identity and timestamps go first, then the
//! user's tags.

use crate::backends::HardwareBackend;
use crate::backends::types::{PortId, PortParameter};
use crate::constants::*;
use crate::errors::ExifError;
use chrono::{DateTime, TimeZone};
use std::fmt::Display;
use tracing::{debug, warn};

/// Tags describing the camera and the capture time
pub fn builtin_tags<Tz: TimeZone>(time: &DateTime<Tz>) -> Vec<String>
where
    Tz::Offset: Display,
{
    let stamp = time.format(EXIF_DATETIME_FORMAT).to_string();
    vec![
        format!("IFD0.Model={EXIF_MODEL}"),
        format!("IFD0.Make={EXIF_MAKE}"),
        format!("EXIF.DateTimeDigitized={stamp}"),
        format!("EXIF.DateTimeOriginal={stamp}"),
        format!("IFD0.DateTime={stamp}"),
    ]
}

/// Check a tag before it is sent to the hardware
pub fn validate_tag(tag: &str) -> Result<(), ExifError> {
    if !tag.contains('=') {
        return Err(ExifError::MissingSeparator(tag.to_string()));
    }
    let max = MAX_EXIF_PAYLOAD_LENGTH - 1;
    if tag.len() > max {
        return Err(ExifError::TooLong {
            len: tag.len(),
            max,
        });
    }
    Ok(())
}

/// Sends tags to the still encoder output port
pub struct ExifTagger<'a> {
    backend: &'a dyn HardwareBackend,
    port: PortId,
}

impl<'a> ExifTagger<'a> {
    pub fn new(backend: &'a dyn HardwareBackend, port: PortId) -> Self {
        Self { backend, port }
    }

    fn send(&self, tag: &str) -> Result<(), ExifError> {
        validate_tag(tag)?;
        self.backend
            .set_parameter(self.port, PortParameter::Exif(tag.to_string()))
            .map_err(|source| ExifError::Backend {
                tag: tag.to_string(),
                source,
            })
    }

    /// Apply the built-in tags and up to [`MAX_USER_EXIF_TAGS`] user tags
    ///
    /// A bad tag is skipped and reported; the others are still applied.
    pub fn apply<Tz: TimeZone>(&self, time: &DateTime<Tz>, user_tags: &[String]) -> Vec<ExifError>
    where
        Tz::Offset: Display,
    {
        let mut errors = Vec::new();

        if user_tags.len() > MAX_USER_EXIF_TAGS {
            warn!(
                count = user_tags.len(),
                max = MAX_USER_EXIF_TAGS,
                "Too many EXIF tags, ignoring the rest"
            );
        }

        let builtin = builtin_tags(time);
        let user = user_tags.iter().take(MAX_USER_EXIF_TAGS);
        for tag in builtin.iter().chain(user) {
            if let Err(e) = self.send(tag) {
                warn!(error = %e, "Skipping EXIF tag");
                errors.push(e);
            }
        }

        debug!(port = %self.port, rejected = errors.len(), "Applied EXIF tags");
        errors
    }
}
