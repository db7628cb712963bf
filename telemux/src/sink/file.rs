//! Raw PCM recorder.
//!
//! Appends the arc samples of every frame to `<dir>/<SENSORID>.pcm`
//! (16-bit little-endian mono, rate as sent by the sensor).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::trace::{debug, warn};
use crate::types::SensorId;
use crate::wire::{Frame, FrameError, SegmentType};

use super::{FileWrite, SinkError};

pub struct FileRecorder {
    dir: PathBuf,
    files: Mutex<HashMap<SensorId, BufWriter<File>>>,
}

impl FileRecorder {
    /// Creates `dir` if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn path_for(&self, sensor: SensorId) -> PathBuf {
        self.dir.join(format!("{sensor}.pcm"))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FileWrite for FileRecorder {
    fn write(&self, sensor: SensorId, frame: &Frame<'_>) -> Result<(), SinkError> {
        let Some(pcm) = frame.arc_pcm() else {
            return Err(SinkError::Rejected(
                FrameError::MissingSegment(SegmentType::Arc).to_string(),
            ));
        };
        let mut files = self.files.lock();
        let writer = match files.entry(sensor) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let path = self.path_for(sensor);
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                debug!(sensor = %sensor, path = %path.display(), "recording");
                e.insert(BufWriter::new(file))
            }
        };
        writer.write_all(pcm)?;
        Ok(())
    }

    fn stop(&self) {
        for (sensor, mut writer) in self.files.lock().drain() {
            if let Err(e) = writer.flush() {
                warn!(sensor = %sensor, error = %e, "failed to flush recording");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FrameBuilder;

    #[test]
    fn appends_pcm_per_sensor() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = FileRecorder::new(dir.path().join("pcm")).unwrap();
        let id = SensorId::new(0xBEEF);

        for seq in 1..=2 {
            let raw = FrameBuilder::new(id)
                .sequence(seq)
                .arc(8_000, &[seq as i16, -1])
                .build();
            recorder.write(id, &Frame::decode(&raw).unwrap()).unwrap();
        }
        recorder.stop();

        let bytes = fs::read(recorder.path_for(id)).unwrap();
        assert_eq!(bytes, vec![1, 0, 0xFF, 0xFF, 2, 0, 0xFF, 0xFF]);
        assert!(recorder.path_for(id).ends_with("00000000BEEF.pcm"));
    }

    #[test]
    fn frame_without_arc_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = FileRecorder::new(dir.path()).unwrap();
        let raw = FrameBuilder::new(SensorId::new(1)).temperature(5).build();
        let err = recorder
            .write(SensorId::new(1), &Frame::decode(&raw).unwrap())
            .unwrap_err();
        assert!(matches!(err, SinkError::Rejected(_)));
    }
}
