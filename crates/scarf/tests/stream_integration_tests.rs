//! Loopback tests for readable and writable streams

mod integration;

use anyhow::Result;
use futures::StreamExt;
use integration::*;
use scarf::proto::StreamState;
use scarf::{ConnectionConfig, ScarfError, ServerConfig, Value};
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn test_readable_stream() -> Result<()> {
    let (_server, client) = start(basic_methods()).await?;

    let stream = client.invoke("readable", vec![json!("param")]).await?.into_readable()?;
    let chunks: Vec<Value> = stream.collect_all().await?;

    assert_eq!(chunks, vec![json!({"beep": "boop"}); 3]);
    Ok(())
}

#[tokio::test]
async fn test_readable_stream_with_callback() -> Result<()> {
    let (_server, client) = start(basic_methods()).await?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    client.invoke_with_callback("readable", vec![], move |result| {
        let _ = tx.send(result.and_then(|reply| reply.into_readable()));
    });

    let mut stream = rx.await??;
    let mut count = 0;
    while let Some(chunk) = stream.next().await {
        assert_eq!(chunk?, json!({"beep": "boop"}));
        count += 1;
    }
    assert_eq!(count, 3);
    assert_eq!(stream.state(), StreamState::Ended);
    Ok(())
}

#[tokio::test]
async fn test_readable_chunks_arrive_as_produced() -> Result<()> {
    let (controlled, source) = Controlled::pair();
    let (_server, client) = start(basic_methods().with_method("live", controlled)).await?;

    let mut stream = client.invoke("live", vec![]).await?.into_readable()?;

    for n in 0..5 {
        source.send(json!(n)).await?;
        let chunk = timeout(Duration::from_secs(1), stream.next_chunk()).await?;
        assert_eq!(chunk.transpose()?, Some(json!(n)));
    }

    drop(source);
    assert!(timeout(Duration::from_secs(1), stream.next_chunk()).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_streams_share_connection_with_calls() -> Result<()> {
    let (controlled, source) = Controlled::pair();
    let (_server, client) = start(basic_methods().with_method("live", controlled)).await?;

    let mut stream = client.invoke("live", vec![]).await?.into_readable()?;

    // Plain calls complete while the stream stays open
    for _ in 0..3 {
        let value = client.invoke("success", vec![]).await?.into_value()?;
        assert_eq!(value, json!([]));
    }

    source.send(json!("late")).await?;
    drop(source);
    assert_eq!(stream.next_chunk().await.transpose()?, Some(json!("late")));
    assert!(stream.next_chunk().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_readable_closed_by_teardown() -> Result<()> {
    let (controlled, _source) = Controlled::pair();
    let (_server, client) = start(basic_methods().with_method("live", controlled)).await?;

    let mut stream = client.invoke("live", vec![]).await?.into_readable()?;
    client.close();

    let err = timeout(Duration::from_secs(1), stream.next_chunk())
        .await?
        .expect("stream should report the teardown")
        .unwrap_err();
    assert!(matches!(err, ScarfError::Connection(_)));
    assert_eq!(stream.state(), StreamState::Errored);
    Ok(())
}

#[tokio::test]
async fn test_writable_stream() -> Result<()> {
    let (collector, collected) = Collector::pair();
    let (_server, client) = start(basic_methods().with_method("writable", collector)).await?;

    let mut stream = client.invoke("writable", vec![json!("param")]).await?.into_writable()?;
    for n in 0..3 {
        stream.write(json!({"n": n})).await?;
    }
    stream.end().await?;

    // `end` resolves only after the sink finished
    assert!(collected.is_finished());
    assert_eq!(
        collected.chunks(),
        vec![json!({"n": 0}), json!({"n": 1}), json!({"n": 2})]
    );
    assert_eq!(collected.aborted(), None);
    Ok(())
}

#[tokio::test]
async fn test_writable_sink_fault() -> Result<()> {
    let (collector, collected) = Collector::rejecting("bad");
    let (_server, client) = start(basic_methods().with_method("writable", collector)).await?;

    let mut stream = client.invoke("writable", vec![]).await?.into_writable()?;
    stream.write("good").await?;
    stream.write("bad").await?;

    // The fault surfaces on a later write or on `end`
    let ended = timeout(Duration::from_secs(1), async {
        loop {
            if let Err(e) = stream.write("more").await {
                return e;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    assert_eq!(ended.to_string(), "rejected \"bad\"");

    let err = stream.end().await.unwrap_err();
    assert_eq!(err.to_string(), "rejected \"bad\"");
    assert_eq!(collected.chunks(), vec![json!("good")]);
    assert!(!collected.is_finished());

    // The connection stays usable
    let value = client.invoke("success", vec![]).await?.into_value()?;
    assert_eq!(value, json!([]));
    Ok(())
}

#[tokio::test]
async fn test_writable_dropped_before_end() -> Result<()> {
    let (collector, collected) = Collector::pair();
    let (_server, client) = start(basic_methods().with_method("writable", collector)).await?;

    let mut stream = client.invoke("writable", vec![]).await?.into_writable()?;
    stream.write(1).await?;
    drop(stream);

    assert!(eventually(|| collected.aborted().is_some()).await);
    assert_eq!(collected.aborted().as_deref(), Some("stream dropped before end"));
    assert!(!collected.is_finished());
    Ok(())
}

#[tokio::test]
async fn test_writer_suspends_while_sink_stalls() -> Result<()> {
    let (gated, gate) = Gated::pair();
    let config = ServerConfig::default().with_connection(ConnectionConfig::default().with_stream_window(4));
    let (_server, client) = start_with(basic_methods().with_method("gated", gated), config).await?;

    let mut stream = client.invoke("gated", vec![]).await?.into_writable()?;
    for n in 0..4 {
        timeout(Duration::from_secs(1), stream.write(n)).await??;
    }

    // The sink has taken nothing, so the window is used up
    assert!(timeout(Duration::from_millis(300), stream.write(4)).await.is_err());
    assert_eq!(gate.taken(), 0);

    // Other calls on the connection are unaffected
    let value = client.invoke("success", vec![]).await?.into_value()?;
    assert_eq!(value, json!([]));

    // Draining one chunk lets exactly one more write through
    gate.release(1);
    timeout(Duration::from_secs(1), stream.write(4)).await??;
    assert!(timeout(Duration::from_millis(100), stream.write(5)).await.is_err());
    assert_eq!(gate.taken(), 1);

    gate.release(16);
    timeout(Duration::from_secs(1), stream.write(5)).await??;
    timeout(Duration::from_secs(1), stream.end()).await??;
    assert_eq!(gate.taken(), 6);
    Ok(())
}

#[tokio::test]
async fn test_never_draining_sink_bounds_writes() -> Result<()> {
    let (gated, gate) = Gated::pair();
    let (_server, client) = start(basic_methods().with_method("gated", gated)).await?;
    let window = ConnectionConfig::default().stream_window as usize;

    let mut stream = client.invoke("gated", vec![]).await?.into_writable()?;
    let mut written = 0;
    let _ = timeout(Duration::from_millis(500), async {
        while stream.write(json!({"pad": "x".repeat(100)})).await.is_ok() {
            written += 1;
        }
    })
    .await;

    assert_eq!(written, window);
    assert_eq!(gate.taken(), 0);
    Ok(())
}

#[tokio::test]
async fn test_dropping_faulted_writable_keeps_connection() -> Result<()> {
    let (collector, _collected) = Collector::rejecting("bad");
    let (_server, client) = start(basic_methods().with_method("writable", collector)).await?;

    // Drop right away, racing the sink's fault, then after the fault arrived
    for delay in [0, 50] {
        let unrelated = client.call("sleep", vec![json!(300)]).await?;

        let mut stream = client.invoke("writable", vec![]).await?.into_writable()?;
        stream.write("bad").await?;
        tokio::time::sleep(Duration::from_millis(delay)).await;
        drop(stream);

        let value = timeout(Duration::from_secs(2), unrelated).await??.into_value()?;
        assert_eq!(value, json!([300]));
        assert!(!client.is_closed());
    }

    let value = client.invoke("success", vec![]).await?.into_value()?;
    assert_eq!(value, json!([]));
    Ok(())
}

#[tokio::test]
async fn test_dropping_writable_mid_stream_keeps_connection() -> Result<()> {
    let (collector, collected) = Collector::pair();
    let (_server, client) = start(basic_methods().with_method("writable", collector)).await?;

    let unrelated = client.call("sleep", vec![json!(200)]).await?;
    let mut stream = client.invoke("writable", vec![]).await?.into_writable()?;
    for n in 0..3 {
        stream.write(n).await?;
    }
    drop(stream);

    assert!(eventually(|| collected.aborted().is_some()).await);
    let value = timeout(Duration::from_secs(2), unrelated).await??.into_value()?;
    assert_eq!(value, json!([200]));

    // A fresh writable on the same connection still works
    let mut stream = client.invoke("writable", vec![]).await?.into_writable()?;
    stream.write("again").await?;
    stream.end().await?;
    assert!(collected.chunks().contains(&json!("again")));
    assert!(collected.is_finished());
    Ok(())
}

#[tokio::test]
async fn test_many_streams_interleaved() -> Result<()> {
    let (_server, client) = start(basic_methods()).await?;

    let mut streams = Vec::new();
    for _ in 0..8 {
        streams.push(client.invoke("readable", vec![]).await?.into_readable()?);
    }

    let mut ids: Vec<u32> = streams.iter().map(|stream| stream.id()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8);

    let results = futures::future::join_all(streams.into_iter().map(|s| s.collect_all())).await;
    for chunks in results {
        assert_eq!(chunks?, vec![json!({"beep": "boop"}); 3]);
    }
    Ok(())
}

#[tokio::test]
async fn test_reply_kind_mismatch() -> Result<()> {
    let (_server, client) = start(basic_methods()).await?;

    let err = client.invoke("success", vec![]).await?.into_readable().unwrap_err();
    assert!(matches!(
        err,
        ScarfError::UnexpectedReply {
            expected: "readable",
            found: "value"
        }
    ));
    Ok(())
}
