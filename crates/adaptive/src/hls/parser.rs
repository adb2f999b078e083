use std::{collections::HashMap, sync::Arc};

use chrono::DateTime;
use url::Url;

use super::attributes::{Attributes, Variables};
use crate::{
    error::{IoriError, IoriResult},
    model::{
        ByteRange, HlsByteRange, InitSegment, KeyDescriptor, KeyMethod, MediaPlaylist,
        MultivariantPlaylist, Part, Playlist, PlaylistType, ProtectionSchemes, Rendition,
        RenditionKind, RenditionReport, Segment, SegmentBase, ServerControl, Variant,
        IDENTITY_KEY_FORMAT,
    },
    time::{secs_to_us, TimeUs, MICROS_PER_SECOND},
};

const PLAYLIST_HEADER: &str = "#EXTM3U";

/// Context a media playlist is parsed in.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseContext<'a> {
    /// The multivariant playlist referencing the parsed playlist.
    pub multivariant: Option<&'a MultivariantPlaylist>,
    /// The last accepted snapshot of the same playlist, used to expand delta updates.
    pub previous: Option<&'a MediaPlaylist>,
}

/// Parses either kind of playlist, deciding by the tags it contains.
pub fn parse_playlist(text: &str, base_url: &Url, context: ParseContext<'_>) -> IoriResult<Playlist> {
    let body = check_header(text)?;

    for line in body.lines().map(str::trim) {
        if line.starts_with("#EXT-X-STREAM-INF")
            || line.starts_with("#EXT-X-MEDIA:")
            || line.starts_with("#EXT-X-I-FRAME-STREAM-INF")
            || line.starts_with("#EXT-X-SESSION-KEY")
        {
            return parse_multivariant_playlist(text, base_url).map(Playlist::Multivariant);
        }
        if line.starts_with("#EXTINF")
            || line.starts_with("#EXT-X-TARGETDURATION")
            || line.starts_with("#EXT-X-MEDIA-SEQUENCE")
            || line.starts_with("#EXT-X-KEY")
            || line.starts_with("#EXT-X-BYTERANGE")
            || line.starts_with("#EXT-X-DISCONTINUITY")
            || line.starts_with("#EXT-X-ENDLIST")
            || line.starts_with("#EXT-X-PART")
            || line.starts_with("#EXT-X-SKIP")
            || line.starts_with("#EXT-X-MAP")
        {
            return parse_media_playlist(text, base_url, context).map(Playlist::Media);
        }
    }

    Err(IoriError::parse(1, "could not identify the playlist kind"))
}

fn check_header(text: &str) -> IoriResult<&str> {
    let text = text.trim_start_matches('\u{feff}').trim_start();
    text.strip_prefix(PLAYLIST_HEADER)
        .ok_or_else(|| IoriError::parse(1, "missing #EXTM3U header"))
}

fn resolve(base_url: &Url, variables: &Variables, uri: &str) -> IoriResult<Url> {
    Ok(base_url.join(&variables.substitute(uri))?)
}

/// Splits `#EXT-X-TAG:value` into `("#EXT-X-TAG", "value")`.
fn split_tag(line: &str) -> (&str, &str) {
    line.split_once(':').unwrap_or((line, ""))
}

fn define_variable(
    attributes: &Attributes,
    base_url: &Url,
    imported: Option<&HashMap<String, String>>,
    variables: &mut Variables,
) {
    if let (Some(name), Some(value)) = (attributes.get("NAME"), attributes.get("VALUE")) {
        variables.define(name.to_string(), value.to_string());
    } else if let Some(name) = attributes.get("IMPORT") {
        if let Some(value) = imported.and_then(|i| i.get(name)) {
            variables.define(name.to_string(), value.clone());
        }
    } else if let Some(name) = attributes.get("QUERYPARAM") {
        if let Some((_, value)) = base_url.query_pairs().find(|(k, _)| k == name) {
            variables.define(name.to_string(), value.into_owned());
        }
    }
}

fn key_descriptor(attributes: &Attributes, base_url: &Url) -> IoriResult<KeyDescriptor> {
    let method = KeyMethod::from(attributes.required("METHOD")?);
    let uri = attributes
        .get("URI")
        .map(|uri| base_url.join(uri))
        .transpose()?;
    Ok(KeyDescriptor {
        method,
        uri,
        iv: attributes.string("IV"),
        key_format: attributes
            .string("KEYFORMAT")
            .unwrap_or_else(|| IDENTITY_KEY_FORMAT.to_string()),
        key_format_versions: attributes.string("KEYFORMATVERSIONS"),
    })
}

pub fn parse_multivariant_playlist(text: &str, base_url: &Url) -> IoriResult<MultivariantPlaylist> {
    let body = check_header(text)?;

    let mut variables = Variables::new();
    let mut variants: Vec<Variant> = Vec::new();
    let mut renditions = Vec::new();
    let mut session_keys: Vec<KeyDescriptor> = Vec::new();
    let mut has_independent_segments = false;
    let mut pending_variant: Option<Attributes> = None;

    for (index, line) in body.lines().enumerate() {
        let line_number = index + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if !line.starts_with('#') {
            let Some(attributes) = pending_variant.take() else {
                tracing::trace!(line = line_number, "ignoring URI without EXT-X-STREAM-INF");
                continue;
            };
            let url = resolve(base_url, &variables, line)?;
            if variants.iter().any(|v| v.url == url) {
                continue;
            }
            variants.push(Variant {
                url,
                bandwidth: attributes.required_decimal("BANDWIDTH")?,
                average_bandwidth: attributes.decimal("AVERAGE-BANDWIDTH"),
                codecs: attributes.string("CODECS"),
                resolution: attributes.resolution("RESOLUTION"),
                frame_rate: attributes.float("FRAME-RATE"),
                audio_group_id: attributes.string("AUDIO"),
                video_group_id: attributes.string("VIDEO"),
                subtitles_group_id: attributes.string("SUBTITLES"),
                closed_captions_group_id: attributes
                    .string("CLOSED-CAPTIONS")
                    .filter(|id| id != "NONE"),
            });
            continue;
        }

        let (tag, value) = split_tag(line);
        match tag {
            "#EXT-X-STREAM-INF" => {
                pending_variant = Some(Attributes::parse(value, &variables, line_number));
            }
            "#EXT-X-MEDIA" => {
                let attributes = Attributes::parse(value, &variables, line_number);
                let kind = match attributes.required("TYPE")? {
                    "AUDIO" => RenditionKind::Audio,
                    "VIDEO" => RenditionKind::Video,
                    "SUBTITLES" => RenditionKind::Subtitles,
                    "CLOSED-CAPTIONS" => RenditionKind::ClosedCaptions,
                    other => {
                        tracing::trace!(kind = other, "ignoring unknown rendition type");
                        continue;
                    }
                };
                let url = match (kind, attributes.get("URI")) {
                    (RenditionKind::ClosedCaptions, _) | (_, None) => None,
                    (_, Some(uri)) => Some(base_url.join(uri)?),
                };
                renditions.push(Rendition {
                    kind,
                    url,
                    group_id: attributes.required("GROUP-ID")?.to_string(),
                    name: attributes.required("NAME")?.to_string(),
                    language: attributes.string("LANGUAGE"),
                    is_default: attributes.flag("DEFAULT"),
                    autoselect: attributes.flag("AUTOSELECT"),
                    characteristics: attributes.string("CHARACTERISTICS"),
                    channels: attributes.string("CHANNELS"),
                });
            }
            "#EXT-X-SESSION-KEY" => {
                let attributes = Attributes::parse(value, &variables, line_number);
                let key = key_descriptor(&attributes, base_url)?;
                if key.method == KeyMethod::None {
                    continue;
                }
                match session_keys
                    .iter_mut()
                    .find(|k| k.key_format == key.key_format)
                {
                    Some(existing) => *existing = key,
                    None => session_keys.push(key),
                }
            }
            "#EXT-X-INDEPENDENT-SEGMENTS" => has_independent_segments = true,
            "#EXT-X-DEFINE" => {
                let attributes = Attributes::parse(value, &variables, line_number);
                define_variable(&attributes, base_url, None, &mut variables);
            }
            _ => tracing::trace!(tag, "ignoring tag in multivariant playlist"),
        }
    }

    Ok(MultivariantPlaylist {
        base_url: base_url.clone(),
        variants,
        renditions,
        session_keys,
        has_independent_segments,
        variable_definitions: variables.into_inner(),
    })
}

pub fn parse_media_playlist(
    text: &str,
    base_url: &Url,
    context: ParseContext<'_>,
) -> IoriResult<MediaPlaylist> {
    let body = check_header(text)?;
    let mut accumulator = MediaPlaylistAccumulator::new(base_url, context);

    for (index, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        accumulator.line = index + 1;
        if line.starts_with('#') {
            accumulator.handle_tag(line)?;
        } else {
            accumulator.handle_uri(line)?;
        }
    }

    Ok(accumulator.finish())
}

/// Mutable parsing state of a media playlist, frozen by [`MediaPlaylistAccumulator::finish`].
struct MediaPlaylistAccumulator<'a> {
    base_url: &'a Url,
    context: ParseContext<'a>,
    line: usize,
    variables: Variables,

    version: u32,
    playlist_type: Option<PlaylistType>,
    start_offset_us: Option<TimeUs>,
    precise_start: bool,
    target_duration_us: u64,
    part_target_duration_us: Option<u64>,
    media_sequence: u64,
    has_discontinuity_sequence: bool,
    discontinuity_sequence: u32,
    has_independent_segments: bool,
    has_end_tag: bool,
    server_control: ServerControl,
    program_date_time_us: Option<TimeUs>,

    segments: Vec<Segment>,
    trailing_parts: Vec<Part>,
    preload_part: Option<Part>,
    rendition_reports: Vec<Attributes>,

    segment_media_sequence: u64,
    segment_start_time_us: TimeUs,
    part_start_time_us: TimeUs,
    relative_discontinuity_sequence: u32,
    segment_duration_us: Option<u64>,
    segment_title: String,
    segment_byte_range: Option<HlsByteRange>,
    segment_byte_offset: u64,
    part_byte_offset: u64,
    has_gap: bool,

    init_segment: Option<Arc<InitSegment>>,
    full_segment_key: Option<Url>,
    encryption_iv: Option<String>,
    schemes: ProtectionSchemes,
    cached_schemes: Option<Arc<ProtectionSchemes>>,
    playlist_protection: Option<Arc<ProtectionSchemes>>,
}

impl<'a> MediaPlaylistAccumulator<'a> {
    fn new(base_url: &'a Url, context: ParseContext<'a>) -> Self {
        Self {
            base_url,
            context,
            line: 0,
            variables: Variables::new(),
            version: 1,
            playlist_type: None,
            start_offset_us: None,
            precise_start: false,
            target_duration_us: 0,
            part_target_duration_us: None,
            media_sequence: 0,
            has_discontinuity_sequence: false,
            discontinuity_sequence: 0,
            has_independent_segments: context
                .multivariant
                .is_some_and(|m| m.has_independent_segments),
            has_end_tag: false,
            server_control: ServerControl::default(),
            program_date_time_us: None,
            segments: Vec::new(),
            trailing_parts: Vec::new(),
            preload_part: None,
            rendition_reports: Vec::new(),
            segment_media_sequence: 0,
            segment_start_time_us: 0,
            part_start_time_us: 0,
            relative_discontinuity_sequence: 0,
            segment_duration_us: None,
            segment_title: String::new(),
            segment_byte_range: None,
            segment_byte_offset: 0,
            part_byte_offset: 0,
            has_gap: false,
            init_segment: None,
            full_segment_key: None,
            encryption_iv: None,
            schemes: ProtectionSchemes::new(),
            cached_schemes: None,
            playlist_protection: None,
        }
    }

    fn attributes(&self, value: &str) -> Attributes {
        Attributes::parse(value, &self.variables, self.line)
    }

    fn resolve(&self, uri: &str) -> IoriResult<Url> {
        resolve(self.base_url, &self.variables, uri)
    }

    fn error(&self, message: impl Into<String>) -> IoriError {
        IoriError::parse(self.line, message)
    }

    fn handle_tag(&mut self, line: &str) -> IoriResult<()> {
        let (tag, value) = split_tag(line);
        match tag {
            "#EXT-X-VERSION" => {
                self.version = value.trim().parse().map_err(|_| self.error("invalid version"))?;
            }
            "#EXT-X-TARGETDURATION" => {
                let seconds: u64 = value
                    .trim()
                    .parse()
                    .map_err(|_| self.error("invalid target duration"))?;
                self.target_duration_us = seconds * MICROS_PER_SECOND as u64;
            }
            "#EXT-X-MEDIA-SEQUENCE" => {
                self.media_sequence = value
                    .trim()
                    .parse()
                    .map_err(|_| self.error("invalid media sequence"))?;
                self.segment_media_sequence = self.media_sequence;
            }
            "#EXT-X-DISCONTINUITY-SEQUENCE" => {
                self.has_discontinuity_sequence = true;
                self.discontinuity_sequence = value
                    .trim()
                    .parse()
                    .map_err(|_| self.error("invalid discontinuity sequence"))?;
            }
            "#EXT-X-PLAYLIST-TYPE" => {
                self.playlist_type = match value.trim() {
                    "VOD" => Some(PlaylistType::Vod),
                    "EVENT" => Some(PlaylistType::Event),
                    _ => None,
                };
            }
            "#EXT-X-START" => {
                let attributes = self.attributes(value);
                self.start_offset_us = Some(attributes.required_seconds_us("TIME-OFFSET")?);
                self.precise_start = attributes.flag("PRECISE");
            }
            "#EXT-X-DEFINE" => {
                let attributes = self.attributes(value);
                let imported = self.context.multivariant.map(|m| &m.variable_definitions);
                define_variable(&attributes, self.base_url, imported, &mut self.variables);
            }
            "#EXT-X-INDEPENDENT-SEGMENTS" => self.has_independent_segments = true,
            "#EXT-X-ENDLIST" => self.has_end_tag = true,
            "#EXT-X-DISCONTINUITY" => self.relative_discontinuity_sequence += 1,
            "#EXT-X-GAP" => self.has_gap = true,
            "#EXTINF" => {
                let (duration, title) = value.split_once(',').unwrap_or((value, ""));
                let seconds: f64 = duration
                    .trim()
                    .parse()
                    .map_err(|_| self.error("invalid EXTINF duration"))?;
                if seconds < 0.0 {
                    return Err(self.error("negative EXTINF duration"));
                }
                self.segment_duration_us = Some(secs_to_us(seconds) as u64);
                self.segment_title = title.trim().to_string();
            }
            "#EXT-X-BYTERANGE" => {
                let range = value.trim().parse().map_err(|_| self.error("invalid byte range"))?;
                self.segment_byte_range = Some(range);
            }
            "#EXT-X-PROGRAM-DATE-TIME" => self.handle_program_date_time(value)?,
            "#EXT-X-MAP" => self.handle_map(value)?,
            "#EXT-X-KEY" => self.handle_key(value)?,
            "#EXT-X-PART-INF" => {
                let attributes = self.attributes(value);
                self.part_target_duration_us =
                    Some(attributes.required_seconds_us("PART-TARGET")?.max(0) as u64);
            }
            "#EXT-X-SERVER-CONTROL" => {
                let attributes = self.attributes(value);
                self.server_control = ServerControl {
                    skip_until_us: attributes.seconds_us("CAN-SKIP-UNTIL"),
                    can_skip_date_ranges: attributes.flag("CAN-SKIP-DATERANGES"),
                    hold_back_us: attributes.seconds_us("HOLD-BACK"),
                    part_hold_back_us: attributes.seconds_us("PART-HOLD-BACK"),
                    can_block_reload: attributes.flag("CAN-BLOCK-RELOAD"),
                };
            }
            "#EXT-X-PART" => self.handle_part(value)?,
            "#EXT-X-PRELOAD-HINT" => self.handle_preload_hint(value)?,
            "#EXT-X-RENDITION-REPORT" => {
                let attributes = self.attributes(value);
                self.rendition_reports.push(attributes);
            }
            "#EXT-X-SKIP" => self.handle_skip(value)?,
            _ => tracing::trace!(tag, "ignoring tag in media playlist"),
        }
        Ok(())
    }

    fn handle_program_date_time(&mut self, value: &str) -> IoriResult<()> {
        if self.program_date_time_us.is_some() {
            return Ok(());
        }
        let time = DateTime::parse_from_rfc3339(value.trim())?;
        let time_us = time.timestamp_micros();
        self.program_date_time_us = Some(time_us - self.segment_start_time_us);
        Ok(())
    }

    fn handle_map(&mut self, value: &str) -> IoriResult<()> {
        let attributes = self.attributes(value);
        let url = self.resolve(attributes.required("URI")?)?;
        let byte_range = attributes
            .get("BYTERANGE")
            .map(|range| range.parse::<HlsByteRange>())
            .transpose()
            .map_err(|_| self.error("invalid EXT-X-MAP byte range"))?
            .map(|range| range.resolve(Some(0)));

        if self.full_segment_key.is_some() && self.encryption_iv.is_none() {
            return Err(self.error(
                "the IV attribute must be present when an initialization segment is encrypted with AES-128",
            ));
        }

        self.init_segment = Some(Arc::new(InitSegment {
            url,
            byte_range,
            full_segment_key: self.full_segment_key.clone(),
            encryption_iv: self.encryption_iv.clone(),
        }));
        self.segment_byte_offset = 0;
        Ok(())
    }

    fn handle_key(&mut self, value: &str) -> IoriResult<()> {
        let attributes = self.attributes(value);
        let key = key_descriptor(&attributes, self.base_url)?;

        self.full_segment_key = None;
        self.encryption_iv = None;
        match key.method {
            KeyMethod::None => {
                self.schemes.clear();
                self.cached_schemes = None;
            }
            KeyMethod::Aes128 if key.key_format == IDENTITY_KEY_FORMAT => {
                let uri = self.resolve(attributes.required("URI")?)?;
                self.full_segment_key = Some(uri);
                self.encryption_iv = key.iv;
            }
            _ if key.key_format == IDENTITY_KEY_FORMAT => {
                tracing::trace!(method = ?key.method, "ignoring identity key with sample encryption");
            }
            _ => {
                self.schemes.insert(key);
                self.cached_schemes = None;
            }
        }
        Ok(())
    }

    fn protection(&mut self) -> Option<Arc<ProtectionSchemes>> {
        if self.schemes.is_empty() {
            return None;
        }
        if self.cached_schemes.is_none() {
            let schemes = Arc::new(self.schemes.clone());
            if self.playlist_protection.is_none() {
                self.playlist_protection = Some(schemes.clone());
            }
            self.cached_schemes = Some(schemes);
        }
        self.cached_schemes.clone()
    }

    fn segment_encryption_iv(&self) -> Option<String> {
        self.full_segment_key.as_ref()?;
        Some(
            self.encryption_iv
                .clone()
                .unwrap_or_else(|| format!("0x{:032x}", self.segment_media_sequence)),
        )
    }

    fn segment_base(
        &mut self,
        url: Url,
        byte_range: Option<ByteRange>,
        duration_us: Option<u64>,
        relative_start_time_us: TimeUs,
        has_gap: bool,
    ) -> SegmentBase {
        SegmentBase {
            url,
            byte_range,
            duration_us,
            relative_start_time_us,
            relative_discontinuity_sequence: self.relative_discontinuity_sequence,
            init_segment: self.init_segment.clone(),
            full_segment_key: self.full_segment_key.clone(),
            encryption_iv: self.segment_encryption_iv(),
            protection: self.protection(),
            has_gap,
        }
    }

    fn handle_part(&mut self, value: &str) -> IoriResult<()> {
        let attributes = self.attributes(value);
        let url = self.resolve(attributes.required("URI")?)?;
        let duration_us = attributes.required_seconds_us("DURATION")?.max(0) as u64;

        let byte_range = match attributes.get("BYTERANGE") {
            Some(range) => {
                let range: HlsByteRange =
                    range.parse().map_err(|_| self.error("invalid part byte range"))?;
                let range = range.resolve(Some(self.part_byte_offset));
                self.part_byte_offset = range.end().unwrap_or(0);
                Some(range)
            }
            None => {
                self.part_byte_offset = 0;
                None
            }
        };

        let base = self.segment_base(
            url,
            byte_range,
            Some(duration_us),
            self.part_start_time_us,
            attributes.flag("GAP"),
        );
        self.trailing_parts.push(Part {
            base,
            is_independent: attributes.flag("INDEPENDENT"),
            is_preload: false,
        });
        self.part_start_time_us += duration_us as TimeUs;
        Ok(())
    }

    fn handle_preload_hint(&mut self, value: &str) -> IoriResult<()> {
        if self.preload_part.is_some() {
            return Ok(());
        }
        let attributes = self.attributes(value);
        if attributes.get("TYPE") != Some("PART") {
            return Ok(());
        }
        let url = self.resolve(attributes.required("URI")?)?;
        let start = attributes.decimal("BYTERANGE-START");
        let length = attributes.decimal("BYTERANGE-LENGTH");
        let byte_range = match (start, length) {
            (None | Some(0), None) => None,
            (start, length) => Some(ByteRange::new(start.unwrap_or(0), length)),
        };

        let base = self.segment_base(url, byte_range, None, self.part_start_time_us, false);
        self.preload_part = Some(Part {
            base,
            is_independent: false,
            is_preload: true,
        });
        Ok(())
    }

    fn handle_skip(&mut self, value: &str) -> IoriResult<()> {
        let attributes = self.attributes(value);
        let skipped = attributes.required_decimal("SKIPPED-SEGMENTS")?;
        let failed = IoriError::DeltaUpdateFailed {
            media_sequence: self.media_sequence,
            skipped,
        };

        let Some(previous) = self.context.previous else {
            return Err(failed);
        };
        if !self.segments.is_empty() {
            return Err(self.error("EXT-X-SKIP must precede every segment"));
        }
        let Some(start) = self.media_sequence.checked_sub(previous.media_sequence) else {
            return Err(failed);
        };
        let end = match start.checked_add(skipped) {
            Some(end) if end <= previous.segments.len() as u64 => end,
            _ => return Err(failed),
        };

        for segment in &previous.segments[start as usize..end as usize] {
            let segment = if self.media_sequence != previous.media_sequence {
                let relative_discontinuity_sequence = (previous.discontinuity_sequence
                    + segment.relative_discontinuity_sequence)
                    .saturating_sub(self.discontinuity_sequence);
                segment.rebased(self.segment_start_time_us, relative_discontinuity_sequence)
            } else {
                segment.clone()
            };

            self.segment_start_time_us += segment.duration_or_zero() as TimeUs;
            self.part_start_time_us = self.segment_start_time_us;
            if let Some(end) = segment.byte_range.and_then(|r| r.end()) {
                self.segment_byte_offset = end;
            }
            self.relative_discontinuity_sequence = segment.relative_discontinuity_sequence;
            self.init_segment = segment.init_segment.clone();
            self.cached_schemes = segment.protection.clone();
            self.full_segment_key = segment.full_segment_key.clone();
            let default_iv = format!("0x{:032x}", self.segment_media_sequence);
            if segment.encryption_iv.as_deref() != Some(default_iv.as_str()) {
                self.encryption_iv = segment.encryption_iv.clone();
            }
            self.segment_media_sequence += 1;
            self.segments.push(segment);
        }
        Ok(())
    }

    fn handle_uri(&mut self, line: &str) -> IoriResult<()> {
        let url = self.resolve(line)?;
        let duration_us = self
            .segment_duration_us
            .take()
            .ok_or_else(|| self.error("segment without EXTINF"))?;

        let byte_range = match self.segment_byte_range.take() {
            Some(range) => {
                let range = range.resolve(Some(self.segment_byte_offset));
                self.segment_byte_offset = range.end().unwrap_or(0);
                Some(range)
            }
            None => {
                self.segment_byte_offset = 0;
                None
            }
        };

        let has_gap = std::mem::take(&mut self.has_gap);
        let base = self.segment_base(
            url,
            byte_range,
            Some(duration_us),
            self.segment_start_time_us,
            has_gap,
        );
        self.segments.push(Segment {
            base,
            title: std::mem::take(&mut self.segment_title),
            parts: std::mem::take(&mut self.trailing_parts),
        });

        self.segment_media_sequence += 1;
        self.segment_start_time_us += duration_us as TimeUs;
        self.part_start_time_us = self.segment_start_time_us;
        Ok(())
    }

    fn rendition_report(
        &self,
        attributes: &Attributes,
        trailing_parts: &[Part],
    ) -> IoriResult<RenditionReport> {
        let url = self.resolve(attributes.required("URI")?)?;
        let default_msn = (self.media_sequence + self.segments.len() as u64)
            .saturating_sub(trailing_parts.is_empty() as u64);
        let default_part = self.part_target_duration_us.and_then(|_| {
            let parts = if trailing_parts.is_empty() {
                self.segments.last().map(|s| s.parts.len()).unwrap_or(0)
            } else {
                trailing_parts.len()
            };
            parts.checked_sub(1)
        });

        Ok(RenditionReport {
            url,
            last_media_sequence: attributes.decimal("LAST-MSN").unwrap_or(default_msn),
            last_part_index: attributes
                .decimal("LAST-PART")
                .map(|p| p as usize)
                .or(default_part),
        })
    }

    fn finish(mut self) -> MediaPlaylist {
        let mut trailing_parts = std::mem::take(&mut self.trailing_parts);
        if let Some(preload) = self.preload_part.take() {
            trailing_parts.push(preload);
        }

        let mut rendition_reports = HashMap::new();
        for attributes in &self.rendition_reports {
            match self.rendition_report(attributes, &trailing_parts) {
                Ok(report) => {
                    rendition_reports.insert(report.url.clone(), report);
                }
                Err(e) => tracing::debug!("ignoring invalid rendition report: {e}"),
            }
        }

        let duration_us = self
            .segments
            .last()
            .map(|s| s.relative_end_time_us().max(0) as u64)
            .unwrap_or(0);
        let start_offset_us = self.start_offset_us.map(|offset| {
            if offset >= 0 {
                offset.min(duration_us as TimeUs)
            } else {
                (duration_us as TimeUs + offset).max(0)
            }
        });

        let protection = self.playlist_protection.clone().or_else(|| {
            let session_keys = &self.context.multivariant?.session_keys;
            (!session_keys.is_empty())
                .then(|| Arc::new(session_keys.iter().cloned().collect::<ProtectionSchemes>()))
        });

        MediaPlaylist {
            base_url: self.base_url.clone(),
            version: self.version,
            playlist_type: self.playlist_type,
            start_offset_us,
            precise_start: self.precise_start,
            start_time_us: self.program_date_time_us.unwrap_or(0),
            has_discontinuity_sequence: self.has_discontinuity_sequence,
            discontinuity_sequence: self.discontinuity_sequence,
            media_sequence: self.media_sequence,
            target_duration_us: self.target_duration_us,
            part_target_duration_us: self.part_target_duration_us,
            has_independent_segments: self.has_independent_segments,
            has_end_tag: self.has_end_tag,
            has_program_date_time: self.program_date_time_us.is_some(),
            segments: self.segments,
            trailing_parts,
            rendition_reports,
            server_control: self.server_control,
            protection,
            duration_us,
        }
    }
}
