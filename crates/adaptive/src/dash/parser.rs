use std::sync::{Arc, LazyLock};

use dash_mpd::{AdaptationSet, ContentProtection, Period, Representation, SegmentList, SegmentTemplate, MPD};
use regex::Regex;
use url::Url;

use super::{
    manifest::{
        ContentType, DashAdaptationSet, DashManifest, DashPeriod, DashRepresentation,
        MediaAddressing, MultiSegmentIndex, SegmentIndex, TimelineEntry, UtcTiming,
    },
    template::{TemplateArgs, UrlTemplate},
    url::{merge_base_urls, nested_base_url},
};
use crate::{
    error::{IoriError, IoriResult},
    model::{ByteRange, InitSegment, KeyDescriptor, KeyMethod, ProtectionSchemes},
    time::{duration_to_us, scale_large_timestamp, secs_to_us, TimeUs, MICROS_PER_SECOND},
};

static LOCATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Location[^>]*>\s*([^<]+?)\s*</Location>").unwrap());

/// Parses an MPD document fetched from `manifest_url`.
///
/// `manifest_url` should be the final URL after redirects, since relative
/// `BaseURL`s resolve against it.
pub fn parse_mpd(text: &str, manifest_url: &Url) -> IoriResult<DashManifest> {
    let mpd = dash_mpd::parse(text)?;
    let location = LOCATION_REGEX
        .captures(text)
        .and_then(|caps| merge_base_urls(manifest_url, caps[1].trim()).ok());
    from_mpd(mpd, manifest_url, location)
}

fn mpd_error(message: impl Into<String>) -> IoriError {
    IoriError::parse(0, message)
}

fn from_mpd(mpd: MPD, manifest_url: &Url, location: Option<Url>) -> IoriResult<DashManifest> {
    let dynamic = mpd.mpdtype.as_deref() == Some("dynamic");
    let base_url = nested_base_url(manifest_url, &mpd.base_url)?;
    let duration_us = mpd.mediaPresentationDuration.map(duration_to_us);

    let mut periods: Vec<DashPeriod> = Vec::with_capacity(mpd.periods.len());
    for (index, period) in mpd.periods.into_iter().enumerate() {
        let period = convert_period(&base_url, index, period, periods.last_mut(), dynamic)?;
        periods.push(period);
    }

    Ok(DashManifest {
        location,
        base_url,
        dynamic,
        availability_start_time: mpd.availabilityStartTime,
        publish_time: mpd.publishTime,
        duration_us,
        min_buffer_time_us: mpd.minBufferTime.map(duration_to_us),
        min_update_period_us: mpd.minimumUpdatePeriod.map(duration_to_us),
        time_shift_buffer_depth_us: mpd.timeShiftBufferDepth.map(duration_to_us),
        suggested_presentation_delay_us: mpd.suggestedPresentationDelay.map(duration_to_us),
        utc_timing: mpd
            .UTCTiming
            .iter()
            .map(|timing| UtcTiming {
                scheme_id_uri: timing.schemeIdUri.clone(),
                value: timing.value.clone(),
            })
            .collect(),
        periods,
    })
}

/// The start of a period is either explicit (`Period@start`) or the end of the previous
/// period. A previous period without duration ends where this one starts.
fn convert_period(
    base_url: &Url,
    index: usize,
    period: Period,
    previous: Option<&mut DashPeriod>,
    dynamic: bool,
) -> IoriResult<DashPeriod> {
    let duration_us = period.duration.map(duration_to_us);
    let start_us = match (period.start.map(duration_to_us), previous) {
        (Some(start), Some(previous)) => {
            if previous.duration_us.is_none() {
                previous.duration_us = Some(start - previous.start_us);
            }
            start
        }
        (Some(start), None) => start,
        (None, Some(previous)) => match previous.duration_us {
            Some(duration) => previous.start_us + duration,
            None => return Err(mpd_error("missing period duration")),
        },
        // The first period of a static presentation starts at zero.
        (None, None) if !dynamic => 0,
        (None, None) => return Err(mpd_error("missing start time for initial period")),
    };

    let base_url = nested_base_url(base_url, &period.BaseURL)?;
    let inherited = InheritedAddressing {
        segment_list: period.SegmentList.as_ref(),
        segment_template: period.SegmentTemplate.as_ref(),
    };

    let mut adaptation_sets = Vec::with_capacity(period.adaptations.len());
    for adaptation_set in &period.adaptations {
        adaptation_sets.push(convert_adaptation_set(
            &base_url,
            &inherited,
            duration_us,
            adaptation_set,
        )?);
    }

    Ok(DashPeriod {
        id: period.id.clone(),
        index,
        start_us,
        duration_us,
        adaptation_sets,
    })
}

fn protection_schemes(elements: &[&ContentProtection]) -> Option<Arc<ProtectionSchemes>> {
    let schemes: ProtectionSchemes = elements
        .iter()
        .map(|protection| KeyDescriptor {
            method: KeyMethod::SampleAesCenc,
            uri: None,
            iv: None,
            key_format: protection.schemeIdUri.to_ascii_lowercase(),
            key_format_versions: protection.value.clone(),
        })
        .collect();
    (!schemes.is_empty()).then(|| Arc::new(schemes))
}

fn convert_adaptation_set(
    base_url: &Url,
    inherited: &InheritedAddressing,
    period_duration_us: Option<TimeUs>,
    adaptation_set: &AdaptationSet,
) -> IoriResult<DashAdaptationSet> {
    let base_url = nested_base_url(base_url, &adaptation_set.BaseURL)?;
    let inherited = InheritedAddressing {
        segment_list: adaptation_set.SegmentList.as_ref(),
        segment_template: adaptation_set.SegmentTemplate.as_ref(),
    }
    .merge(inherited);

    let mut protection: Vec<&ContentProtection> = adaptation_set.ContentProtection.iter().collect();
    let mut representations = Vec::with_capacity(adaptation_set.representations.len());
    for (index, representation) in adaptation_set.representations.iter().enumerate() {
        protection.extend(representation.ContentProtection.iter());
        representations.push(convert_representation(
            &base_url,
            &inherited,
            index,
            period_duration_us,
            representation,
        )?);
    }

    let content_type = ContentType::from_attributes(
        adaptation_set.contentType.as_deref(),
        adaptation_set.mimeType.as_deref().or_else(|| {
            adaptation_set
                .representations
                .first()
                .and_then(|r| r.mimeType.as_deref())
        }),
    );

    Ok(DashAdaptationSet {
        content_type,
        language: adaptation_set.lang.clone(),
        protection: protection_schemes(&protection),
        representations,
    })
}

fn convert_representation(
    base_url: &Url,
    inherited: &InheritedAddressing,
    index: usize,
    period_duration_us: Option<TimeUs>,
    representation: &Representation,
) -> IoriResult<DashRepresentation> {
    let base_url = nested_base_url(base_url, &representation.BaseURL)?;
    let id = representation
        .id
        .clone()
        .unwrap_or_else(|| index.to_string());
    let bandwidth = representation.bandwidth.unwrap_or(0);

    let addressing = InheritedAddressing {
        segment_list: representation.SegmentList.as_ref(),
        segment_template: representation.SegmentTemplate.as_ref(),
    }
    .merge(inherited);

    let segment_index = if representation.SegmentBase.is_some() {
        SegmentIndex::Single {
            url: base_url.clone(),
            byte_range: None,
            init: None,
        }
    } else if let Some(list) = addressing.segment_list {
        segment_list_index(&base_url, list)?
    } else if let Some(template) = addressing.segment_template {
        segment_template_index(&base_url, &id, bandwidth, period_duration_us, template)?
    } else {
        SegmentIndex::Single {
            url: base_url.clone(),
            byte_range: None,
            init: None,
        }
    };

    Ok(DashRepresentation {
        id,
        bandwidth,
        codecs: representation.codecs.clone(),
        width: representation.width,
        height: representation.height,
        base_url,
        index: segment_index,
    })
}

fn segment_list_index(base_url: &Url, list: &SegmentList) -> IoriResult<SegmentIndex> {
    let init = list
        .Initialization
        .as_ref()
        .and_then(|init| init.sourceURL.as_deref())
        .map(|source| merge_base_urls(base_url, source))
        .transpose()?
        .map(|url| {
            Arc::new(InitSegment {
                url,
                byte_range: None,
                full_segment_key: None,
                encryption_iv: None,
            })
        });

    let mut entries = Vec::with_capacity(list.segment_urls.len());
    for segment in &list.segment_urls {
        let url = match &segment.media {
            Some(media) => merge_base_urls(base_url, media)?,
            None => base_url.clone(),
        };
        let byte_range = segment
            .mediaRange
            .as_deref()
            .and_then(ByteRange::from_dash_range);
        entries.push((url, byte_range));
    }

    Ok(SegmentIndex::Multi(MultiSegmentIndex {
        init,
        timescale: list.timescale.unwrap_or(1),
        presentation_time_offset: 0,
        start_number: 1,
        duration: list.duration,
        timeline: None,
        availability_time_offset_us: 0,
        addressing: MediaAddressing::List(entries),
    }))
}

fn segment_template_index(
    base_url: &Url,
    representation_id: &str,
    bandwidth: u64,
    period_duration_us: Option<TimeUs>,
    template: &SegmentTemplate,
) -> IoriResult<SegmentIndex> {
    let media = template
        .media
        .as_deref()
        .map(|media| merge_base_urls(base_url, media))
        .transpose()?
        .map(|url| UrlTemplate::new(url.as_str().replace("%24", "$")))
        .ok_or_else(|| mpd_error("missing media url template in representation"))?;

    let init = template
        .initialization
        .as_deref()
        .map(|init| merge_base_urls(base_url, init))
        .transpose()?
        .map(|url| {
            let url = UrlTemplate::new(url.as_str().replace("%24", "$")).resolve(TemplateArgs {
                representation_id,
                bandwidth,
                number: None,
                time: None,
            });
            Url::parse(&url)
        })
        .transpose()?
        .map(|url| {
            Arc::new(InitSegment {
                url,
                byte_range: None,
                full_segment_key: None,
                encryption_iv: None,
            })
        });

    let timescale = template.timescale.unwrap_or(1).max(1);
    let presentation_time_offset = template.presentationTimeOffset.unwrap_or(0);
    let timeline = template.SegmentTimeline.as_ref().map(|timeline| {
        let period_end = period_duration_us.map(|d| {
            scale_large_timestamp(d, timescale as i64, MICROS_PER_SECOND) as u64
                + presentation_time_offset
        });
        let mut entries = Vec::new();
        let mut time = timeline.segments.first().and_then(|s| s.t).unwrap_or(0);
        for (index, s) in timeline.segments.iter().enumerate() {
            if let Some(t) = s.t {
                time = t;
            }
            if s.d == 0 {
                continue;
            }
            let repeat = match s.r.unwrap_or(0) {
                // Negative repeat lasts until the next S@t, or the end of the period.
                r if r < 0 => {
                    let end = timeline
                        .segments
                        .get(index + 1)
                        .and_then(|next| next.t)
                        .or(period_end);
                    match end {
                        Some(end) if end > time => (end - time).div_ceil(s.d) - 1,
                        _ => 0,
                    }
                }
                r => r as u64,
            };
            for _ in 0..=repeat {
                entries.push(TimelineEntry {
                    start: time,
                    duration: s.d,
                });
                time += s.d;
            }
        }
        entries
    });

    Ok(SegmentIndex::Multi(MultiSegmentIndex {
        init,
        timescale,
        presentation_time_offset,
        start_number: template.startNumber.unwrap_or(1),
        duration: template.duration.map(|d| d as u64),
        timeline,
        availability_time_offset_us: template
            .availabilityTimeOffset
            .filter(|offset| offset.is_finite())
            .map(secs_to_us)
            .unwrap_or(0),
        addressing: MediaAddressing::Template {
            media,
            representation_id: representation_id.to_string(),
            bandwidth,
        },
    }))
}

/// Addressing elements may be declared at period, adaptation set or representation
/// level; the innermost declaration wins.
struct InheritedAddressing<'a> {
    segment_list: Option<&'a SegmentList>,
    segment_template: Option<&'a SegmentTemplate>,
}

impl<'a> InheritedAddressing<'a> {
    fn merge(self, outer: &InheritedAddressing<'a>) -> Self {
        Self {
            segment_list: self.segment_list.or(outer.segment_list),
            segment_template: self.segment_template.or(outer.segment_template),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE_MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic"
     availabilityStartTime="2024-01-01T00:00:00Z"
     publishTime="2024-01-01T00:10:00Z"
     minimumUpdatePeriod="PT2S" timeShiftBufferDepth="PT30S"
     suggestedPresentationDelay="PT6S" minBufferTime="PT2S">
  <Location>https://cdn.example.com/live/next.mpd</Location>
  <UTCTiming schemeIdUri="urn:mpeg:dash:utc:direct:2014" value="2024-01-01T00:10:00Z"/>
  <Period id="p0" start="PT0S">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <ContentProtection schemeIdUri="urn:uuid:EDEF8BA9-79D6-4ACE-A3C8-27DCD51D21ED"/>
      <SegmentTemplate timescale="1000" duration="2000" startNumber="1"
          initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/$Number$.m4s"/>
      <Representation id="720p" bandwidth="3000000" width="1280" height="720" codecs="avc1.64001f"/>
      <Representation id="360p" bandwidth="800000" width="640" height="360" codecs="avc1.64001e"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="en">
      <SegmentTemplate timescale="48000" initialization="a/init.mp4" media="a/$Time$.m4s">
        <SegmentTimeline>
          <S t="0" d="96000" r="2"/>
          <S d="48000"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="audio" bandwidth="128000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn test_parse_live_mpd() {
        let url = Url::parse("https://example.com/live/manifest.mpd?token=1").unwrap();
        let manifest = parse_mpd(LIVE_MPD, &url).unwrap();

        assert!(manifest.dynamic);
        assert_eq!(
            manifest.location.as_ref().unwrap().as_str(),
            "https://cdn.example.com/live/next.mpd"
        );
        assert_eq!(manifest.min_update_period_us, Some(2_000_000));
        assert_eq!(manifest.time_shift_buffer_depth_us, Some(30_000_000));
        assert_eq!(manifest.suggested_presentation_delay_us, Some(6_000_000));
        assert_eq!(manifest.utc_timing.len(), 1);
        assert!(manifest.publish_time.is_some());

        let period = &manifest.periods[0];
        assert_eq!(period.key(), "p0");
        assert_eq!(period.adaptation_sets.len(), 2);

        let video = &period.adaptation_sets[0];
        assert_eq!(video.content_type, ContentType::Video);
        assert_eq!(
            video.protection.as_ref().unwrap().iter().next().unwrap().key_format,
            "urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed"
        );
        let representation = &video.representations[0];
        assert_eq!(representation.bandwidth, 3_000_000);
        assert_eq!(
            representation.index.init_segment().unwrap().url.as_str(),
            "https://example.com/live/720p/init.mp4?token=1"
        );
        let SegmentIndex::Multi(index) = &representation.index else {
            panic!("expected a template index");
        };
        assert_eq!(
            index.segment_url(3).unwrap().0.as_str(),
            "https://example.com/live/720p/3.m4s?token=1"
        );

        let audio = &period.adaptation_sets[1];
        assert_eq!(audio.language.as_deref(), Some("en"));
        let SegmentIndex::Multi(index) = &audio.representations[0].index else {
            panic!("expected a timeline index");
        };
        assert_eq!(index.timeline.as_ref().unwrap().len(), 4);
        assert_eq!(index.time_us(4), 6_000_000);
        assert_eq!(
            index.segment_url(2).unwrap().0.as_str(),
            "https://example.com/live/a/96000.m4s?token=1"
        );
    }

    #[test]
    fn test_period_start_inheritance() {
        let text = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT30S">
  <Period duration="PT10S">
    <AdaptationSet mimeType="video/mp4">
      <Representation id="v" bandwidth="1"><BaseURL>first.mp4</BaseURL><SegmentBase/></Representation>
    </AdaptationSet>
  </Period>
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <SegmentList timescale="1" duration="5">
        <SegmentURL media="b1.mp4" mediaRange="0-99"/>
        <SegmentURL media="b2.mp4"/>
      </SegmentList>
      <Representation id="v" bandwidth="1"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let manifest_url = Url::parse("https://example.com/vod/manifest.mpd").unwrap();
        let manifest = parse_mpd(text, &manifest_url).unwrap();
        assert!(!manifest.dynamic);
        assert_eq!(manifest.periods[0].start_us, 0);
        assert_eq!(manifest.periods[1].start_us, 10_000_000);
        assert_eq!(manifest.period_duration_us(1), Some(20_000_000));

        let SegmentIndex::Single { url, .. } = &manifest.periods[0].adaptation_sets[0]
            .representations[0]
            .index
        else {
            panic!("expected a single segment");
        };
        assert_eq!(url.as_str(), "https://example.com/vod/first.mp4");

        let playlists = manifest.materialize(&manifest_url, 0, 100);
        let second = DashManifest::track_url(&manifest_url, &manifest.periods[1], "v");
        let playlist = &playlists[&second];
        assert_eq!(playlist.segments.len(), 2);
        assert_eq!(
            playlist.segments[0].byte_range,
            Some(ByteRange::new(0, Some(100)))
        );
        assert!(playlist.has_end_tag);
    }
}
