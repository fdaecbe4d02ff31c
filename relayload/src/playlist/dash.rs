use std::sync::Arc;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{IterationDeadline, PlaylistLoader};
use crate::error::LoaderError;
use crate::task::Task;

/// DASH manifests are walked with a streaming `quick_xml::Reader` rather
/// than full serde deserialization: only a handful of attributes out of
/// the full MPD schema matter here, and a hand-rolled event walk keeps the
/// parser from depending on a struct shape that has to mirror the *entire*
/// schema just to reach a few leaves.
#[derive(Clone, Default)]
struct SegmentTemplateState {
    media: Option<String>,
    timescale: Option<u64>,
    start_number: Option<u64>,
    timeline: Vec<TimelineEntry>,
}

#[derive(Clone, Copy, Default)]
struct TimelineEntry {
    t: Option<i64>,
    d: i64,
    r: i64,
}

struct RepresentationSegments {
    id: String,
    template: SegmentTemplateState,
}

#[derive(Clone, Copy, PartialEq)]
enum Scope {
    Root,
    Period,
    AdaptationSet,
    Representation,
}

struct ParsedManifest {
    availability_start_time: String,
    suggested_presentation_delay: Option<String>,
    representations: Vec<RepresentationSegments>,
}

pub(super) async fn handle(
    loader: &PlaylistLoader,
    iteration: &IterationDeadline,
    url: &url::Url,
    body: &[u8],
) -> Result<(), LoaderError> {
    let manifest = parse(url, body)?;

    let availability_start_time: DateTime<Utc> = manifest
        .availability_start_time
        .parse()
        .map_err(|_| LoaderError::missing_field(url, "availabilityStartTime"))?;
    let delay = manifest
        .suggested_presentation_delay
        .as_deref()
        .and_then(parse_iso8601_seconds)
        .unwrap_or(3.0);
    let presentation_edge = Utc::now() - chrono::Duration::milliseconds((delay * 1000.0) as i64);
    let sample = loader.sample();

    for name in eligible_segment_names(&manifest, availability_start_time, presentation_edge, sample) {
        if let Ok(segment_url) = crate::url_resolve::resolve_sub_url(url, &name) {
            loader.enqueue(iteration, Arc::new(Task::new(segment_url, iteration.deadline()))).await;
        }
    }

    Ok(())
}

/// Walks every Representation's SegmentTimeline and returns the templated
/// segment URI for each segment whose wall time has crossed the
/// presentation edge and whose offset is a sample-stride multiple.
/// Pure and deterministic given `now`, so it is the unit this module's
/// tests exercise directly rather than going through `handle`'s real-time
/// clock read.
fn eligible_segment_names(
    manifest: &ParsedManifest,
    availability_start_time: DateTime<Utc>,
    presentation_edge: DateTime<Utc>,
    sample: u32,
) -> Vec<String> {
    let mut names = Vec::new();
    for rep in &manifest.representations {
        let Some(media) = rep.template.media.as_deref() else { continue };
        let Some(timescale) = rep.template.timescale else { continue };
        let start_number = rep.template.start_number.unwrap_or(1);

        let mut cursor: i64 = 0;
        let mut offset: u64 = 0;
        for entry in &rep.template.timeline {
            if let Some(t) = entry.t {
                cursor = t;
            }
            for _ in 0..=entry.r.max(0) {
                let ts = availability_start_time
                    + chrono::Duration::milliseconds(
                        (cursor as f64 / timescale as f64 * 1000.0) as i64,
                    );
                if presentation_edge > ts && offset % sample as u64 == 0 {
                    names.push(
                        media
                            .replace("$RepresentationID$", &rep.id)
                            .replace("$Number$", &(start_number + offset).to_string()),
                    );
                }
                cursor += entry.d;
                offset += 1;
            }
        }
    }
    names
}

fn parse(url: &url::Url, body: &[u8]) -> Result<ParsedManifest, LoaderError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| LoaderError::missing_field(url, "(non-utf8 manifest body)"))?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut availability_start_time = None;
    let mut suggested_presentation_delay = None;
    let mut period_count = 0u32;
    let mut in_first_period = false;
    let mut scope = Scope::Root;
    let mut adaptation_tpl = SegmentTemplateState::default();
    let mut rep_tpl = SegmentTemplateState::default();
    let mut rep_id = None;
    let mut in_timeline = false;
    let mut representations = Vec::new();

    loop {
        match reader
            .read_event()
            .map_err(|source| LoaderError::DashParse { url: url.to_string(), source })?
        {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e) => {
                let name = local_name(&e);
                match name.as_str() {
                    "MPD" => {
                        availability_start_time = attr(&e, "availabilityStartTime");
                        suggested_presentation_delay = attr(&e, "suggestedPresentationDelay");
                    }
                    "Period" => {
                        period_count += 1;
                        in_first_period = period_count == 1;
                        if in_first_period {
                            scope = Scope::Period;
                        }
                    }
                    "AdaptationSet" if in_first_period => {
                        scope = Scope::AdaptationSet;
                        adaptation_tpl = SegmentTemplateState::default();
                    }
                    "Representation" if in_first_period => {
                        scope = Scope::Representation;
                        rep_id = attr(&e, "id");
                        rep_tpl = adaptation_tpl.clone();
                    }
                    "SegmentTemplate" if in_first_period => {
                        let tpl = match scope {
                            Scope::AdaptationSet => &mut adaptation_tpl,
                            Scope::Representation => &mut rep_tpl,
                            _ => continue,
                        };
                        if let Some(media) = attr(&e, "media") {
                            tpl.media = Some(media);
                        }
                        if let Some(ts) = attr(&e, "timescale").and_then(|v| v.parse().ok()) {
                            tpl.timescale = Some(ts);
                        }
                        if let Some(sn) = attr(&e, "startNumber").and_then(|v| v.parse().ok()) {
                            tpl.start_number = Some(sn);
                        }
                    }
                    "SegmentTimeline" if in_first_period => {
                        in_timeline = true;
                        let tpl = match scope {
                            Scope::AdaptationSet => &mut adaptation_tpl,
                            Scope::Representation => &mut rep_tpl,
                            _ => continue,
                        };
                        tpl.timeline.clear();
                    }
                    "S" if in_timeline => {
                        let tpl = match scope {
                            Scope::AdaptationSet => &mut adaptation_tpl,
                            Scope::Representation => &mut rep_tpl,
                            _ => continue,
                        };
                        tpl.timeline.push(TimelineEntry {
                            t: attr(&e, "t").and_then(|v| v.parse().ok()),
                            d: attr(&e, "d").and_then(|v| v.parse().ok()).unwrap_or(0),
                            r: attr(&e, "r").and_then(|v| v.parse().ok()).unwrap_or(0),
                        });
                    }
                    _ => {}
                }
            }
            Event::End(e) => match local_name(&e).as_str() {
                "SegmentTimeline" => in_timeline = false,
                "Representation" if in_first_period => {
                    if let Some(id) = rep_id.take() {
                        representations
                            .push(RepresentationSegments { id, template: rep_tpl.clone() });
                    }
                    scope = Scope::AdaptationSet;
                }
                "AdaptationSet" if in_first_period => scope = Scope::Period,
                "Period" if in_first_period => {
                    in_first_period = false;
                    scope = Scope::Root;
                }
                _ => {}
            },
            _ => {}
        }
    }

    let availability_start_time = availability_start_time
        .ok_or_else(|| LoaderError::missing_field(url, "availabilityStartTime"))?;

    for rep in &representations {
        if rep.template.media.is_none() {
            return Err(LoaderError::missing_field(url, "SegmentTemplate@media"));
        }
        if rep.template.timescale.is_none() {
            return Err(LoaderError::missing_field(url, "SegmentTemplate@timescale"));
        }
    }

    Ok(ParsedManifest { availability_start_time, suggested_presentation_delay, representations })
}

fn local_name(e: &BytesStart) -> String {
    let full = e.name();
    let bytes = full.as_ref();
    match bytes.iter().position(|&b| b == b':') {
        Some(idx) => String::from_utf8_lossy(&bytes[idx + 1..]).into_owned(),
        None => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn attr(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == name.as_bytes() {
            Some(String::from_utf8_lossy(&a.value).into_owned())
        } else {
            None
        }
    })
}

/// Parses the subset of ISO-8601 durations DASH actually emits for
/// `suggestedPresentationDelay`: `PT#H#M#S` with an optional fractional
/// seconds component.
fn parse_iso8601_seconds(s: &str) -> Option<f64> {
    let s = s.strip_prefix("PT")?;
    let mut seconds = 0.0;
    let mut num = String::new();
    for c in s.chars() {
        match c {
            '0'..='9' | '.' => num.push(c),
            'H' => {
                seconds += num.parse::<f64>().ok()? * 3600.0;
                num.clear();
            }
            'M' => {
                seconds += num.parse::<f64>().ok()? * 60.0;
                num.clear();
            }
            'S' => {
                seconds += num.parse::<f64>().ok()?;
                num.clear();
            }
            _ => return None,
        }
    }
    Some(seconds)
}
