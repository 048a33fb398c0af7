//! HTTP body 类型与构造工具

use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Empty, Full, combinators::UnsyncBoxBody};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};

use crate::error::BoxError;

/// 请求与响应统一使用的装箱 body
pub type Body = UnsyncBoxBody<Bytes, BoxError>;

pub fn empty() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

pub fn full(data: impl Into<Bytes>) -> Body {
    Full::new(data.into()).map_err(|never| match never {}).boxed_unsync()
}

/// 把 hyper 的 `Incoming` 等 body 擦除成 [`Body`]
pub fn boxed<B>(body: B) -> Body
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

/// 纯文本响应
pub fn text_response(status: StatusCode, text: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(full(text.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// JSON 响应
pub fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Body> {
    let mut response = Response::new(full(value.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// 读完整个 body
pub async fn collect_bytes(body: Body) -> Result<Bytes, BoxError> {
    Ok(body.collect().await?.to_bytes())
}

/// 取出缓冲区里所有完整的行（去掉首尾空白，跳过空行），不完整的尾部留在缓冲区
pub(crate) fn take_lines(pending: &mut BytesMut) -> Vec<Bytes> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
        let line = pending.split_to(pos + 1).freeze();
        let start = line.iter().position(|b| !b.is_ascii_whitespace());
        let end = line.iter().rposition(|b| !b.is_ascii_whitespace());
        if let (Some(start), Some(end)) = (start, end) {
            lines.push(line.slice(start..=end));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_lines_only() {
        let mut pending = BytesMut::from(&b"{\"result\":1}\r\n\n  {\"result\":2}\n{\"res"[..]);
        let lines = take_lines(&mut pending);
        assert_eq!(lines, vec![Bytes::from_static(b"{\"result\":1}"), Bytes::from_static(b"{\"result\":2}")]);
        assert_eq!(&pending[..], b"{\"res");
    }

    #[tokio::test]
    async fn text_response_sets_plain_content_type() {
        let response = text_response(StatusCode::IM_A_TEAPOT, "short and stout");
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        let bytes = collect_bytes(response.into_body()).await.unwrap();
        assert_eq!(&bytes[..], b"short and stout");
    }
}
