use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use appforge::core::llm::{ChatMessage, LlmConfig, LlmProvider};
use appforge::core::llm::providers::OpenAiCompatProvider;

/// Serve exactly one HTTP request with a canned response, then close.
async fn serve_once(listener: TcpListener, body: &str) {
    let (mut sock, _) = listener.accept().await.unwrap();

    // Drain the request: headers, then the declared body length.
    let mut buf = vec![0u8; 64 * 1024];
    let mut read = 0;
    loop {
        let n = sock.read(&mut buf[read..]).await.unwrap();
        if n == 0 {
            break;
        }
        read += n;
        let text = String::from_utf8_lossy(&buf[..read]).into_owned();
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text
                .lines()
                .find_map(|line| {
                    let line = line.to_ascii_lowercase();
                    line.strip_prefix("content-length:")
                        .and_then(|v| v.trim().parse::<usize>().ok())
                })
                .unwrap_or(0);
            if read >= header_end + 4 + content_length {
                break;
            }
        }
    }

    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         content-type: text/event-stream\r\n\
         content-length: {}\r\n\
         connection: close\r\n\r\n{}",
        body.len(),
        body
    );
    sock.write_all(response.as_bytes()).await.unwrap();
    sock.shutdown().await.unwrap();
}

fn config() -> LlmConfig {
    LlmConfig {
        model: "test-model".to_string(),
        temperature: Some(0.0),
        max_tokens: Some(64),
        top_p: Some(1.0),
    }
}

#[tokio::test]
async fn stream_chunks_are_forwarded_and_aggregated() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = "data: {\"model\":\"test-model\",\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
                data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
                data: [DONE]\n\n";
    let server = tokio::spawn(serve_once(listener, body));

    let provider =
        OpenAiCompatProvider::new("test", format!("http://{}", addr), "key").unwrap();
    let mut chunks: Vec<String> = Vec::new();
    let response = provider
        .stream_chat(
            &[ChatMessage::user("say hello")],
            &config(),
            &mut |chunk| chunks.push(chunk.to_string()),
        )
        .await
        .unwrap();
    server.await.unwrap();

    assert_eq!(chunks, vec!["Hel", "lo"]);
    assert_eq!(response.content, "Hello");
    assert_eq!(response.model, "test-model");
}

#[tokio::test]
async fn malformed_frames_are_skipped_not_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = "data: this is not json\n\n\
                : keep-alive comment\n\n\
                data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n\
                data: [DONE]\n\n";
    let server = tokio::spawn(serve_once(listener, body));

    let provider =
        OpenAiCompatProvider::new("test", format!("http://{}", addr), "key").unwrap();
    let mut chunks: Vec<String> = Vec::new();
    let response = provider
        .stream_chat(
            &[ChatMessage::user("hi")],
            &config(),
            &mut |chunk| chunks.push(chunk.to_string()),
        )
        .await
        .unwrap();
    server.await.unwrap();

    assert_eq!(chunks, vec!["ok"]);
    assert_eq!(response.content, "ok");
}

#[tokio::test]
async fn http_error_status_is_a_provider_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let _ = sock.read(&mut buf).await;
        let body = "{\"error\":\"rate limited\"}";
        let response = format!(
            "HTTP/1.1 429 Too Many Requests\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        sock.write_all(response.as_bytes()).await.unwrap();
        sock.shutdown().await.unwrap();
    });

    let provider =
        OpenAiCompatProvider::new("test", format!("http://{}", addr), "key").unwrap();
    let err = provider
        .chat(&[ChatMessage::user("hi")], &config())
        .await
        .unwrap_err();
    server.await.unwrap();

    assert!(err.to_string().contains("429"));
}
