use crate::config::{AppSessionConfig, NOT_SET_RIDE, UNSPECIFIED_RIDE};
use crate::persistence::sanitize_file_name;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    pub fn extension(&self) -> &'static str {
        match self {
            MediaKind::Photo => "jpeg",
            MediaKind::Video => "3gp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub path: PathBuf,
    pub kind: MediaKind,
}

impl MediaAttachment {
    pub fn new(path: impl Into<PathBuf>, kind: MediaKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Captured photos/videos.
///
/// Captures sit in `pending` under whatever name the camera gave them until a
/// ride name is known; `flush` renames them and moves them to the upload-ready
/// lists. Nothing is ever dropped, including when setup is cancelled.
#[derive(Debug, Clone, Default)]
pub struct MediaQueue {
    pending: Vec<MediaAttachment>,
    ready_photos: Vec<MediaAttachment>,
    ready_videos: Vec<MediaAttachment>,
}

impl MediaQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture(&mut self, attachment: MediaAttachment) {
        log::debug!("captured {:?} {}", attachment.kind, attachment.path.display());
        self.pending.push(attachment);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready_photos.len() + self.ready_videos.len()
    }

    /// Pending + ready
    pub fn media_count(&self) -> usize {
        self.pending_count() + self.ready_count()
    }

    pub fn ready_photos(&self) -> &[MediaAttachment] {
        &self.ready_photos
    }

    pub fn ready_videos(&self) -> &[MediaAttachment] {
        &self.ready_videos
    }

    pub fn flush(&mut self, config: &AppSessionConfig, folder: &Path) -> usize {
        self.flush_at(config, folder, Local::now())
    }

    /// Renames pending captures to `{ride}-{seats}-{timestamp}-{index}.{ext}` in `folder`.
    ///
    /// Index counts from 1 per kind and skips names already on disk, so an earlier
    /// flush in the same second is never overwritten. A failed rename keeps the
    /// capture under its original path. Returns how many attachments became upload-ready.
    pub fn flush_at(&mut self, config: &AppSessionConfig, folder: &Path, now: DateTime<Local>) -> usize {
        if self.pending.is_empty() {
            return 0;
        }

        let ride = match config.ride_label() {
            NOT_SET_RIDE => UNSPECIFIED_RIDE,
            name => name,
        };
        let seats = config.seat_count.unwrap_or(1);
        let stamp = now.format("%m-%d-%Y--%H-%M-%S");

        if let Err(e) = fs::create_dir_all(folder) {
            log::warn!("Cannot create media folder {}: {}", folder.display(), e);
        }

        let mut photo_index = 0u32;
        let mut video_index = 0u32;
        let flushed = self.pending.len();

        for attachment in std::mem::take(&mut self.pending) {
            let index = match attachment.kind {
                MediaKind::Photo => &mut photo_index,
                MediaKind::Video => &mut video_index,
            };
            let target = free_target(folder, &format!("{}-{}-{}", ride, seats, stamp), attachment.kind, index);

            let path = match fs::rename(&attachment.path, &target) {
                Ok(()) => target,
                Err(e) => {
                    log::warn!(
                        "Keeping {} under its original name (rename failed: {})",
                        attachment.path.display(),
                        e
                    );
                    attachment.path
                }
            };

            let ready = MediaAttachment::new(path, attachment.kind);
            match ready.kind {
                MediaKind::Photo => self.ready_photos.push(ready),
                MediaKind::Video => self.ready_videos.push(ready),
            }
        }

        log::info!("{} media attachment(s) queued for upload", flushed);
        flushed
    }

    /// Ready attachments in upload order: newest photo first, then newest video first
    pub fn upload_order(&self) -> Vec<MediaAttachment> {
        self.ready_photos
            .iter()
            .rev()
            .chain(self.ready_videos.iter().rev())
            .cloned()
            .collect()
    }

    /// Empties the ready lists, returning them in upload order
    pub fn take_ready(&mut self) -> Vec<MediaAttachment> {
        let order = self.upload_order();
        self.ready_photos.clear();
        self.ready_videos.clear();
        order
    }

    /// Puts back attachments an interrupted upload did not get to.
    ///
    /// `remaining` is in upload order; they go in front of anything captured
    /// since, so newer captures still upload first.
    pub fn requeue(&mut self, remaining: Vec<MediaAttachment>) {
        let mut photos = Vec::new();
        let mut videos = Vec::new();
        for attachment in remaining.into_iter().rev() {
            match attachment.kind {
                MediaKind::Photo => photos.push(attachment),
                MediaKind::Video => videos.push(attachment),
            }
        }
        photos.append(&mut self.ready_photos);
        videos.append(&mut self.ready_videos);
        self.ready_photos = photos;
        self.ready_videos = videos;
    }
}

/// Next `{prefix}-{index}.{ext}` in `folder` that does not exist yet; advances `index` past it
fn free_target(folder: &Path, prefix: &str, kind: MediaKind, index: &mut u32) -> PathBuf {
    loop {
        *index += 1;
        let name = sanitize_file_name(&format!("{}-{}.{}", prefix, index, kind.extension()));
        let target = folder.join(name);
        if !target.exists() {
            return target;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> AppSessionConfig {
        AppSessionConfig {
            ride_name: Some("Boston Tea Party".to_string()),
            seat_count: Some(2),
            ..Default::default()
        }
    }

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 18, 12, 30, 5).unwrap()
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"media").unwrap();
        path
    }

    #[test]
    fn test_flush_renames_into_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("iSENSE");
        let mut queue = MediaQueue::new();
        queue.capture(MediaAttachment::new(touch(dir.path(), "IMG_001.jpg"), MediaKind::Photo));
        queue.capture(MediaAttachment::new(touch(dir.path(), "VID_001.mp4"), MediaKind::Video));
        queue.capture(MediaAttachment::new(touch(dir.path(), "IMG_002.jpg"), MediaKind::Photo));

        assert_eq!(queue.flush_at(&config(), &folder, noon()), 3);
        assert_eq!(queue.pending_count(), 0);

        let photos: Vec<_> = queue.ready_photos().iter().map(|a| a.path.clone()).collect();
        assert_eq!(
            photos,
            vec![
                folder.join("Boston Tea Party-2-10-18-2026--12-30-05-1.jpeg"),
                folder.join("Boston Tea Party-2-10-18-2026--12-30-05-2.jpeg"),
            ]
        );
        assert_eq!(
            queue.ready_videos()[0].path,
            folder.join("Boston Tea Party-2-10-18-2026--12-30-05-1.3gp")
        );
        assert!(photos.iter().all(|p| p.exists()));
    }

    #[test]
    fn test_flushes_in_the_same_second_keep_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("iSENSE");
        let mut queue = MediaQueue::new();

        let a = dir.path().join("a.jpg");
        fs::write(&a, b"AAAA").unwrap();
        queue.capture(MediaAttachment::new(&a, MediaKind::Photo));
        queue.flush_at(&config(), &folder, noon());

        let b = dir.path().join("b.jpg");
        fs::write(&b, b"BBBB").unwrap();
        queue.capture(MediaAttachment::new(&b, MediaKind::Photo));
        queue.flush_at(&config(), &folder, noon());

        let paths: Vec<_> = queue.ready_photos().iter().map(|a| a.path.clone()).collect();
        assert_ne!(paths[0], paths[1]);
        assert_eq!(
            paths[1],
            folder.join("Boston Tea Party-2-10-18-2026--12-30-05-2.jpeg")
        );
        assert_eq!(fs::read(&paths[0]).unwrap(), b"AAAA");
        assert_eq!(fs::read(&paths[1]).unwrap(), b"BBBB");
    }

    #[test]
    fn test_unset_ride_uses_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = MediaQueue::new();
        queue.capture(MediaAttachment::new(touch(dir.path(), "a.jpg"), MediaKind::Photo));

        queue.flush_at(&AppSessionConfig::default(), dir.path(), noon());
        let name = queue.ready_photos()[0].path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("Unspecified Ride-1-"));
    }

    #[test]
    fn test_missing_source_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let ghost = dir.path().join("gone.jpg");
        let mut queue = MediaQueue::new();
        queue.capture(MediaAttachment::new(&ghost, MediaKind::Photo));

        assert_eq!(queue.flush_at(&config(), dir.path(), noon()), 1);
        assert_eq!(queue.ready_photos()[0].path, ghost);
    }

    #[test]
    fn test_upload_order_is_reverse_insertion() {
        let mut queue = MediaQueue::new();
        queue.ready_photos = vec![
            MediaAttachment::new("p1", MediaKind::Photo),
            MediaAttachment::new("p2", MediaKind::Photo),
        ];
        queue.ready_videos = vec![MediaAttachment::new("v1", MediaKind::Video)];

        let order: Vec<_> = queue.upload_order().into_iter().map(|a| a.path).collect();
        assert_eq!(
            order,
            vec![PathBuf::from("p2"), PathBuf::from("p1"), PathBuf::from("v1")]
        );
    }

    #[test]
    fn test_requeue_goes_ahead_of_new_captures() {
        let mut queue = MediaQueue::new();
        queue.ready_photos = vec![
            MediaAttachment::new("p1", MediaKind::Photo),
            MediaAttachment::new("p2", MediaKind::Photo),
            MediaAttachment::new("p3", MediaKind::Photo),
        ];
        let mut taken = queue.take_ready();
        assert_eq!(queue.ready_count(), 0);

        // p3 uploaded, the rest interrupted; p4 captured meanwhile
        taken.remove(0);
        queue.ready_photos.push(MediaAttachment::new("p4", MediaKind::Photo));
        queue.requeue(taken);

        let order: Vec<_> = queue.upload_order().into_iter().map(|a| a.path).collect();
        assert_eq!(
            order,
            vec![PathBuf::from("p4"), PathBuf::from("p2"), PathBuf::from("p1")]
        );
    }

    #[test]
    fn test_media_count() {
        let mut queue = MediaQueue::new();
        queue.capture(MediaAttachment::new("x.jpg", MediaKind::Photo));
        queue.ready_videos.push(MediaAttachment::new("y.3gp", MediaKind::Video));
        assert_eq!(queue.media_count(), 2);
    }
}
