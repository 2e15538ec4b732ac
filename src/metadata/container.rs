use std::path::Path;

use lofty::{MimeType, Picture, PictureType, Probe, Tag, TagExt, TagType, TaggedFileExt};

use crate::errors::{AppError, Result};
use crate::metadata::MetadataFields;

/// The closed set of supported container families. Adding a format means
/// adding a variant, not extending a branch chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Mp3,
    Flac,
    OggVorbis,
    Mp4,
    Wav,
    Aiff,
}

impl ContainerFormat {
    /// Resolves the container family from the file extension. Anything
    /// outside the known set is a hard failure.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "mp3" => Ok(Self::Mp3),
            "flac" => Ok(Self::Flac),
            "ogg" | "oga" => Ok(Self::OggVorbis),
            "m4a" | "mp4" => Ok(Self::Mp4),
            "wav" => Ok(Self::Wav),
            "aiff" => Ok(Self::Aiff),
            other => Err(AppError::UnsupportedFormat(format!(".{other}"))),
        }
    }

    /// The native tag scheme: ID3v2 frames, Vorbis comment keys, or MP4
    /// ilst atoms.
    pub fn tag_type(&self) -> TagType {
        match self {
            Self::Mp3 | Self::Wav | Self::Aiff => TagType::Id3v2,
            Self::Flac | Self::OggVorbis => TagType::VorbisComments,
            Self::Mp4 => TagType::Mp4Ilst,
        }
    }

    /// Whether the scheme has a usable embedded-picture slot. Formats
    /// without one drop the cover silently rather than failing.
    pub fn supports_picture(&self) -> bool {
        matches!(self, Self::Mp3 | Self::Flac | Self::Mp4)
    }
}

/// Strips every existing tag structure from the container. Errors are
/// logged, not propagated: a file with nothing to strip is not an error,
/// and a half-broken old tag must not block the rewrite.
pub fn strip_tags(path: &Path) {
    let tagged = match Probe::open(path).and_then(|probe| probe.read()) {
        Ok(tagged) => tagged,
        Err(e) => {
            log::warn!("could not probe existing tags in {:?}: {e}", path);
            return;
        }
    };

    for tag in tagged.tags() {
        let tag_type = tag.tag_type();
        if let Err(e) = tag_type.remove_from_path(path) {
            log::warn!("failed to strip {tag_type:?} from {:?}: {e}", path);
        }
    }
}

/// Builds the replacement tag for a container family. Only present,
/// non-empty fields produce entries; unsupported slots are dropped.
pub fn build_tag(format: ContainerFormat, fields: &MetadataFields) -> Tag {
    use lofty::ItemKey;

    let mut tag = Tag::new(format.tag_type());

    insert_text_field(&mut tag, ItemKey::TrackTitle, Some(&fields.title));
    insert_text_field(&mut tag, ItemKey::TrackArtist, fields.artist.as_deref());
    insert_text_field(&mut tag, ItemKey::AlbumTitle, fields.album.as_deref());
    insert_text_field(&mut tag, ItemKey::RecordingDate, fields.year.as_deref());
    insert_text_field(&mut tag, ItemKey::Lyrics, fields.lyrics.as_deref());
    insert_text_field(&mut tag, ItemKey::Comment, fields.comment.as_deref());

    if format.supports_picture() {
        if let Some(cover) = &fields.cover {
            if !cover.is_empty() {
                let mime = infer_cover_mime(cover);
                let picture =
                    Picture::new_unchecked(PictureType::CoverFront, Some(mime), None, cover.clone());
                tag.push_picture(picture);
            }
        }
    }

    tag
}

fn insert_text_field(tag: &mut Tag, key: lofty::ItemKey, value: Option<&str>) {
    let Some(value) = value else { return };
    if value.is_empty() {
        return;
    }
    if !tag.insert_text(key.clone(), value.to_string()) {
        log::warn!("tag scheme rejected {key:?}, field skipped");
    }
}

/// Cover MIME is inferred from magic bytes: the PNG signature wins,
/// everything else is treated as JPEG.
pub fn infer_cover_mime(data: &[u8]) -> MimeType {
    if data.starts_with(b"\x89PNG") {
        MimeType::Png
    } else {
        MimeType::Jpeg
    }
}

/// Strips the old tag structures and writes the canonical field set,
/// saving the container back in place. The audio payload is untouched;
/// only the save step can fail the operation.
pub fn write_tags(path: &Path, fields: &MetadataFields) -> Result<()> {
    let format = ContainerFormat::from_path(path)?;
    log::info!("writing {:?} tags to {:?}", format, path);

    strip_tags(path);

    let tag = build_tag(format, fields);
    tag.save_to_path(path)
        .map_err(|e| AppError::Metadata(format!("failed to save tags to {:?}: {e}", path)))?;

    log::info!("tag rewrite complete for {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lofty::{Accessor, ItemKey};

    fn all_fields() -> MetadataFields {
        MetadataFields {
            title: "Song".to_string(),
            artist: Some("Artist".to_string()),
            album: Some("Album".to_string()),
            year: Some("2024".to_string()),
            lyrics: Some("la la la".to_string()),
            comment: Some("from the archive".to_string()),
            cover: Some(vec![0xFF, 0xD8, 0xFF, 0xE0]),
        }
    }

    #[test]
    fn extension_dispatch_covers_known_set() {
        assert_eq!(
            ContainerFormat::from_path(Path::new("a.mp3")).unwrap(),
            ContainerFormat::Mp3
        );
        assert_eq!(
            ContainerFormat::from_path(Path::new("a.FLAC")).unwrap(),
            ContainerFormat::Flac
        );
        assert_eq!(
            ContainerFormat::from_path(Path::new("a.oga")).unwrap(),
            ContainerFormat::OggVorbis
        );
        assert_eq!(
            ContainerFormat::from_path(Path::new("a.m4a")).unwrap(),
            ContainerFormat::Mp4
        );
        assert_eq!(
            ContainerFormat::from_path(Path::new("a.wav")).unwrap(),
            ContainerFormat::Wav
        );
        assert_eq!(
            ContainerFormat::from_path(Path::new("a.aiff")).unwrap(),
            ContainerFormat::Aiff
        );
    }

    #[test]
    fn unknown_extension_is_a_hard_failure() {
        let err = ContainerFormat::from_path(Path::new("a.wma")).unwrap_err();
        assert!(err.to_string().contains("unsupported format"));
        assert!(ContainerFormat::from_path(Path::new("noext")).is_err());
    }

    #[test]
    fn build_tag_round_trips_all_text_fields() {
        let tag = build_tag(ContainerFormat::Mp3, &all_fields());
        assert_eq!(tag.title().as_deref(), Some("Song"));
        assert_eq!(tag.artist().as_deref(), Some("Artist"));
        assert_eq!(tag.album().as_deref(), Some("Album"));
        assert_eq!(tag.get_string(&ItemKey::RecordingDate), Some("2024"));
        assert_eq!(tag.get_string(&ItemKey::Lyrics), Some("la la la"));
        assert_eq!(tag.get_string(&ItemKey::Comment), Some("from the archive"));
        assert_eq!(tag.pictures().len(), 1);
        assert_eq!(tag.pictures()[0].pic_type(), PictureType::CoverFront);
    }

    #[test]
    fn absent_fields_produce_no_entries() {
        let fields = MetadataFields {
            title: "Only Title".to_string(),
            ..MetadataFields::default()
        };
        let tag = build_tag(ContainerFormat::Mp3, &fields);
        assert_eq!(tag.title().as_deref(), Some("Only Title"));
        assert!(tag.artist().is_none());
        assert!(tag.album().is_none());
        assert!(tag.get_string(&ItemKey::Lyrics).is_none());
        assert!(tag.get_string(&ItemKey::Comment).is_none());
        assert!(tag.pictures().is_empty());
        assert_eq!(tag.item_count(), 1);
    }

    #[test]
    fn empty_strings_are_treated_as_absent() {
        let fields = MetadataFields {
            title: "T".to_string(),
            artist: Some(String::new()),
            album: Some(String::new()),
            ..MetadataFields::default()
        };
        let tag = build_tag(ContainerFormat::Flac, &fields);
        assert!(tag.artist().is_none());
        assert!(tag.album().is_none());
        assert_eq!(tag.item_count(), 1);
    }

    #[test]
    fn formats_without_picture_slot_drop_the_cover() {
        for format in [
            ContainerFormat::OggVorbis,
            ContainerFormat::Wav,
            ContainerFormat::Aiff,
        ] {
            let tag = build_tag(format, &all_fields());
            assert!(tag.pictures().is_empty(), "{format:?} should drop covers");
        }
    }

    #[test]
    fn cover_mime_is_sniffed_from_magic_bytes() {
        let png = b"\x89PNG\r\n\x1a\n....";
        assert_eq!(infer_cover_mime(png), MimeType::Png);
        assert_eq!(infer_cover_mime(&[0xFF, 0xD8, 0xFF]), MimeType::Jpeg);
    }

    #[test]
    fn native_schemes_match_their_family() {
        assert_eq!(ContainerFormat::Mp3.tag_type(), TagType::Id3v2);
        assert_eq!(ContainerFormat::Wav.tag_type(), TagType::Id3v2);
        assert_eq!(ContainerFormat::Aiff.tag_type(), TagType::Id3v2);
        assert_eq!(ContainerFormat::Flac.tag_type(), TagType::VorbisComments);
        assert_eq!(ContainerFormat::OggVorbis.tag_type(), TagType::VorbisComments);
        assert_eq!(ContainerFormat::Mp4.tag_type(), TagType::Mp4Ilst);
    }
}
