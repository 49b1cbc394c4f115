// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-session media directory layout and the transform-or-fallback
//! decision. `vargos-media` supplies image decode/resize/
//! hash-cache; this module adds the inbound-attachment bookkeeping the
//! Channel Service needs around it.

use std::path::{Path, PathBuf};

use chrono::Utc;

/// The normalized shape every adapter's media path converges on before it
/// reaches the Agent Service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Voice,
    File,
    Video,
}

impl MediaKind {
    pub fn from_mime_type(mime_type: &str) -> Self {
        if mime_type.starts_with("image/") {
            MediaKind::Image
        } else if mime_type.starts_with("audio/") {
            MediaKind::Voice
        } else if mime_type.starts_with("video/") {
            MediaKind::Video
        } else {
            MediaKind::File
        }
    }
}

/// `{type, content, metadata: {mimeType, caption}}` — the normalized input
/// the rest of the pipeline operates on, regardless of which adapter or
/// provider the bytes arrived from.
#[derive(Debug, Clone)]
pub struct NormalizedMedia {
    pub kind: MediaKind,
    pub content: Vec<u8>,
    pub mime_type: String,
    pub caption: Option<String>,
    /// Where the raw bytes were persisted ( step 1).
    pub saved_path: PathBuf,
}

/// `<data>/media/<sessionKey>/` — the directory a session's inbound media
/// is saved under.
pub fn session_media_dir(data_dir: &Path, session_key: &str) -> PathBuf {
    data_dir.join("media").join(vargos_sessions::safe_key(session_key))
}

fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "audio/ogg" => "ogg",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/wav" | "audio/x-wav" => "wav",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}

/// Save `bytes` under the session's media directory with a stable,
/// timestamp-derived file name, and return the normalized media record.
pub fn save_media(
    data_dir: &Path,
    session_key: &str,
    mime_type: &str,
    bytes: &[u8],
    caption: Option<String>,
) -> std::io::Result<NormalizedMedia> {
    let dir = session_media_dir(data_dir, session_key);
    std::fs::create_dir_all(&dir)?;
    let ext = extension_for_mime(mime_type);
    let file_name = format!("{}.{ext}", Utc::now().timestamp_millis());
    let path = dir.join(file_name);
    std::fs::write(&path, bytes)?;
    Ok(NormalizedMedia {
        kind: MediaKind::from_mime_type(mime_type),
        content: bytes.to_vec(),
        mime_type: mime_type.to_string(),
        caption,
        saved_path: path,
    })
}

/// What the Agent Service should do with a piece of inbound media before
/// running the agent ( step 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaDisposition {
    /// A transform is configured (image→description, audio→transcript):
    /// run it and substitute its text output into the task.
    Transform,
    /// No transform, the media is an image, and the primary model accepts
    /// images: forward the raw bytes as an attachment.
    ForwardToVision,
    /// No transform and no vision support (or non-image media): fall back
    /// to a short text descriptor in place of the attachment.
    TextFallback(String),
}

/// Decide how to handle a piece of media given whether a transform is
/// configured and whether the target model is vision-capable.
pub fn decide_disposition(
    media: &NormalizedMedia,
    transform_configured: bool,
    model_supports_vision: bool,
) -> MediaDisposition {
    if transform_configured {
        return MediaDisposition::Transform;
    }
    if media.kind == MediaKind::Image && model_supports_vision {
        return MediaDisposition::ForwardToVision;
    }
    MediaDisposition::TextFallback(text_descriptor(media.kind, None))
}

/// Same decision, but for media whose duration is known (voice/video),
/// which the text fallback includes (e.g. `[Voice message, 7s]`).
pub fn decide_disposition_timed(
    media: &NormalizedMedia,
    transform_configured: bool,
    model_supports_vision: bool,
    duration_secs: Option<u64>,
) -> MediaDisposition {
    if transform_configured {
        return MediaDisposition::Transform;
    }
    if media.kind == MediaKind::Image && model_supports_vision {
        return MediaDisposition::ForwardToVision;
    }
    MediaDisposition::TextFallback(text_descriptor(media.kind, duration_secs))
}

fn text_descriptor(kind: MediaKind, duration_secs: Option<u64>) -> String {
    match (kind, duration_secs) {
        (MediaKind::Voice, Some(s)) => format!("[Voice message, {s}s]"),
        (MediaKind::Voice, None) => "[Voice message]".to_string(),
        (MediaKind::Video, Some(s)) => format!("[Video, {s}s]"),
        (MediaKind::Video, None) => "[Video]".to_string(),
        (MediaKind::Image, _) => "[Image]".to_string(),
        (MediaKind::File, _) => "[File attachment]".to_string(),
    }
}
