// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bulkfetch_common_http::Response;
use http::header;
use reqwest::Url;

/// Size and name of a remote file, as reported by a HEAD request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// From `Content-Length`, when present and numeric.
    pub size: Option<u64>,
    /// From `Content-Disposition`, else the last URL path segment.
    pub name: String,
}

impl FileInfo {
    pub fn from_response(url: &Url, response: &Response) -> Self {
        let name = response
            .header_str(header::CONTENT_DISPOSITION)
            .and_then(disposition_filename)
            .filter(|name| !name.is_empty())
            .map_or_else(|| last_segment(url), str::to_owned);

        Self {
            size: response.content_length(),
            name,
        }
    }
}

/// The `filename` or `filename*` parameter of a `Content-Disposition` value,
/// with any `UTF-8''` prefix or opening quote removed. Not percent-decoded.
fn disposition_filename(value: &str) -> Option<&str> {
    const KEY: &str = "filename";
    const UTF8_PREFIX: &str = "UTF-8''";
    let lower = value.to_ascii_lowercase();

    let mut from = 0;
    while let Some(found) = lower[from..].find(KEY) {
        let start = from + found + KEY.len();
        from = start;

        let rest = &value[start..];
        let rest = rest.strip_prefix('*').unwrap_or(rest);
        let Some(rest) = rest.strip_prefix('=') else {
            continue;
        };

        let rest = if rest
            .get(..UTF8_PREFIX.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(UTF8_PREFIX))
        {
            &rest[UTF8_PREFIX.len()..]
        } else {
            rest.strip_prefix('"').unwrap_or(rest)
        };
        let end = rest
            .find(|c| matches!(c, ';' | '"' | '\r' | '\n'))
            .unwrap_or(rest.len());
        return Some(&rest[..end]);
    }
    None
}

fn last_segment(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, HeaderValue, StatusCode};

    use super::*;

    fn response(url: &Url, headers: &[(&'static str, &'static str)]) -> Response {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_static(value));
        }
        Response {
            status:  StatusCode::OK,
            headers: map,
            url:     url.clone(),
            body:    None,
        }
    }

    #[test]
    fn parses_disposition_variants() {
        assert_eq!(
            disposition_filename(r#"attachment; filename="sodium-0.5.jar""#),
            Some("sodium-0.5.jar")
        );
        assert_eq!(
            disposition_filename("attachment; filename=plain.zip; size=10"),
            Some("plain.zip")
        );
        assert_eq!(
            disposition_filename("attachment; FILENAME*=utf-8''na%C3%AFve.jar"),
            Some("na%C3%AFve.jar")
        );
        assert_eq!(disposition_filename("inline"), None);
        assert_eq!(disposition_filename("attachment; filenames=x"), None);
    }

    #[test]
    fn probe_uses_headers() {
        let url = Url::parse("https://cdn.test/data/ABCD/versions/1/lithium.jar").unwrap();
        let info = FileInfo::from_response(
            &url,
            &response(&url, &[
                ("content-length", "2048"),
                ("content-disposition", r#"attachment; filename="renamed.jar""#),
            ]),
        );

        assert_eq!(info, FileInfo {
            size: Some(2048),
            name: "renamed.jar".to_string(),
        });
    }

    #[test]
    fn probe_falls_back_to_url() {
        let url = Url::parse("https://cdn.test/files/mod%20pack.zip?token=1").unwrap();
        let info = FileInfo::from_response(
            &url,
            &response(&url, &[
                ("content-length", "many"),
                ("content-disposition", "attachment; filename="),
            ]),
        );

        assert_eq!(info.size, None);
        assert_eq!(info.name, "mod%20pack.zip");
    }
}
