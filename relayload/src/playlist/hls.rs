use std::sync::Arc;

use m3u8_rs::{parse_playlist_res, Playlist};
use tracing::warn;
use url::Url;

use super::{IterationDeadline, PlaylistLoader};
use crate::error::LoaderError;
use crate::task::Task;

/// RFC 8216's live-edge lookback: the last three segments of a media
/// playlist are considered unstable and are never requested.
const LIVE_EDGE_LOOKBACK: u64 = 2;

pub(super) async fn handle(
    loader: &PlaylistLoader,
    iteration: &IterationDeadline,
    url: &Url,
    body: &[u8],
) -> Result<(), LoaderError> {
    match parse_playlist_res(body) {
        Ok(Playlist::MasterPlaylist(master)) => {
            for variant in &master.variants {
                let Ok(variant_url) = crate::url_resolve::resolve_sub_url(url, &variant.uri) else {
                    warn!(url = %url, uri = %variant.uri, "unresolvable variant URI, skipping");
                    continue;
                };
                Box::pin(loader.recurse(iteration, &variant_url)).await?;
            }
            Ok(())
        }
        Ok(Playlist::MediaPlaylist(media)) => {
            let segment_count = media.segments.len() as u64;
            let live_edge = segment_count.saturating_sub(LIVE_EDGE_LOOKBACK);
            let sample = loader.sample() as u64;

            for (idx, segment) in media.segments.iter().enumerate() {
                let offset = idx as u64 + 1;
                if !is_eligible(offset, live_edge, sample) {
                    continue;
                }
                let Ok(segment_url) = crate::url_resolve::resolve_sub_url(url, &segment.uri) else {
                    warn!(url = %url, uri = %segment.uri, "unresolvable segment URI, skipping");
                    continue;
                };
                loader
                    .enqueue(iteration, Arc::new(Task::new(segment_url, iteration.deadline())))
                    .await;
            }
            Ok(())
        }
        Err(err) => Err(LoaderError::HlsParse { url: url.to_string(), reason: err.to_string() }),
    }
}

/// A 1-based segment `offset` is eligible once it clears the live-edge
/// lookback (`offset < live_edge`, where `live_edge = segmentCount - 2`)
/// and lands on a sample-stride multiple.
fn is_eligible(offset: u64, live_edge: u64, sample: u64) -> bool {
    offset < live_edge && offset % sample.max(1) == 0
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::http::AuthConfig;

    /// spec.md §8 scenario 1: 30 segments, sample=5 -> offsets
    /// {5,10,15,20,25} eligible per variant (offset 1 is excluded since
    /// it isn't a multiple of 5; the last two segments are excluded by
    /// the live-edge lookback).
    #[test]
    fn thirty_segment_media_playlist_matches_the_worked_example() {
        let segment_count = 30;
        let live_edge = segment_count - 2;
        let eligible: Vec<u64> =
            (1..=segment_count).filter(|&offset| is_eligible(offset, live_edge, 5)).collect();
        assert_eq!(eligible, vec![5, 10, 15, 20, 25]);
    }

    #[test]
    fn the_last_two_segments_are_never_eligible_regardless_of_sample() {
        let segment_count = 10;
        let live_edge = segment_count - 2;
        assert!(!is_eligible(9, live_edge, 1));
        assert!(!is_eligible(10, live_edge, 1));
        assert!(is_eligible(8, live_edge, 1));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// spec.md §8, invariant 2: emitted task count never exceeds
        /// `ceil(eligibleSegments / sample)` (before `factor` multiplication,
        /// which is applied uniformly at enqueue time and doesn't change
        /// this count).
        #[test]
        fn emitted_count_never_exceeds_ceil_of_eligible_over_sample(
            segment_count in 3u64..500,
            sample in 1u32..20,
        ) {
            let live_edge = segment_count.saturating_sub(2);
            let eligible_count = live_edge.saturating_sub(1);
            let emitted = (1..=segment_count)
                .filter(|&offset| is_eligible(offset, live_edge, sample as u64))
                .count() as u64;
            let bound = eligible_count.div_ceil(sample as u64);
            prop_assert!(emitted <= bound);
        }
    }

    fn variant_playlist(prefix: &str) -> String {
        let mut pl = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n");
        for i in 0..30 {
            pl.push_str("#EXTINF:4.0,\n");
            pl.push_str(&format!("{prefix}{i}.ts\n"));
        }
        pl
    }

    /// Minimal HTTP/1.1 loopback server: maps a request path to canned
    /// playlist bodies, good enough to drive a real `PlaylistLoader::load`
    /// call end to end without a mock-HTTP crate.
    async fn spawn_playlist_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let n = conn.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

                    let body = match path.as_str() {
                        "/live/master.m3u8" => {
                            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nlow.m3u8\n\
                             #EXT-X-STREAM-INF:BANDWIDTH=1600000\nmid.m3u8\n\
                             #EXT-X-STREAM-INF:BANDWIDTH=3200000\nhigh.m3u8\n"
                                .to_string()
                        }
                        "/live/low.m3u8" => variant_playlist("seg"),
                        "/live/mid.m3u8" => variant_playlist("seg"),
                        "/live/high.m3u8" => variant_playlist("seg"),
                        _ => String::new(),
                    };

                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = conn.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    /// spec.md §8 scenario 1, driven through real HTTP: a master playlist
    /// fanning out to three 30-segment variants, `sample=5`, `factor=1`.
    /// Per-variant eligible offsets are {5,10,15,20,25} (offset 1 isn't a
    /// multiple of 5; the last two segments are excluded by the live-edge
    /// lookback) -- 5 offsets, so 15 tasks across all three variants. The
    /// scenario's prose total of 18 doesn't reconcile with its own
    /// enumerated offset list (5 values, not 6); the enumerated offsets
    /// are treated as authoritative, same as the DASH scenario 2
    /// `RepeatCount` resolution in DESIGN.md.
    #[tokio::test]
    async fn hls_master_playlist_fans_out_to_three_variants_end_to_end() {
        let addr = spawn_playlist_server().await;
        let master_url = format!("http://{addr}/live/master.m3u8");

        let (tasks_tx, mut tasks_rx) = mpsc::channel(64);
        let client = crate::http::build_client(Duration::from_secs(3)).unwrap();
        let loader = PlaylistLoader::new(
            client,
            AuthConfig::none(),
            5,
            1,
            Duration::from_secs(3),
            tasks_tx,
        );

        loader.load(&CancellationToken::new(), &master_url).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(task) = tasks_rx.try_recv() {
            seen.push(task.url.path().to_string());
        }

        assert_eq!(seen.len(), 15);
        for expected in ["seg5.ts", "seg10.ts", "seg15.ts", "seg20.ts", "seg25.ts"] {
            let count = seen.iter().filter(|p| p.ends_with(expected)).count();
            assert_eq!(count, 3, "{expected} should appear once per variant");
        }
    }
}
