//! Image pulls streamed into an `image:pull:<reference>` progress channel.

use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;

use crate::websocket::protocol::image_pull_channel;
use crate::websocket::{DockerProgressHook, ProgressChannel, ProgressError, ProgressRegistry};

/// Open (or supersede) the pull channel for `image`, with daemon progress parsing.
/// With `fd` set the output goes to that client only and the channel is closed
/// once it disconnects.
pub fn open_pull(progress: &ProgressRegistry, image: &str, fd: Option<&str>) -> Arc<ProgressChannel> {
    let name = image_pull_channel(image);
    let channel = match fd {
        Some(fd) => progress.open_for(&name, fd, false),
        None => progress.open(&name, false),
    };
    channel.set_hook(Arc::new(DockerProgressHook::new()));
    channel
}

pub async fn pull_image(
    progress: &ProgressRegistry,
    docker: &Docker,
    image: &str,
    fd: Option<&str>,
) -> Result<(), ProgressError> {
    let channel = open_pull(progress, image, fd);
    pull_into(&channel, docker, image).await
}

/// Drive the daemon's pull stream into an already open channel.
pub async fn pull_into(channel: &ProgressChannel, docker: &Docker, image: &str) -> Result<(), ProgressError> {
    let (from_image, tag) = split_reference(image);
    tracing::info!(channel = %channel.name(), generation = channel.generation(), image = %image, "pulling image");

    let options = Some(CreateImageOptions {
        from_image,
        tag,
        ..Default::default()
    });
    forward(channel, docker.create_image(options, None, None)).await
}

/// Feed each progress record to the channel as one JSON line. Stops early if the
/// channel is superseded or closed; a daemon error becomes the final message.
pub async fn forward<S, T, E>(channel: &ProgressChannel, stream: S) -> Result<(), ProgressError>
where
    S: Stream<Item = Result<T, E>>,
    T: Serialize,
    E: Display,
{
    let mut stream = std::pin::pin!(stream);
    loop {
        let item = tokio::select! {
            _ = channel.done() => {
                tracing::debug!(channel = %channel.name(), "pull abandoned, channel closed");
                return Ok(());
            }
            item = stream.next() => item,
        };

        match item {
            Some(Ok(info)) => {
                let mut line = match serde_json::to_vec(&info) {
                    Ok(line) => line,
                    Err(e) => {
                        channel.fail(&e.to_string());
                        return Err(ProgressError::Hook(e.to_string()));
                    }
                };
                line.push(b'\n');
                if let Err(e) = channel.write(&line) {
                    // The hook has already reported the error to subscribers.
                    tracing::warn!(channel = %channel.name(), "pull failed: {}", e);
                    channel.close();
                    return Err(e);
                }
            }
            Some(Err(e)) => {
                tracing::warn!(channel = %channel.name(), "pull failed: {}", e);
                channel.fail(&e.to_string());
                return Err(ProgressError::Daemon(e.to_string()));
            }
            None => break,
        }
    }

    tracing::info!(channel = %channel.name(), "pull finished");
    channel.close();
    Ok(())
}

/// Split `repo[:tag]`, leaving registry ports and digests alone.
/// A reference without a tag, or with an empty one, pulls `latest`; an empty tag
/// would make the daemon pull every tag of the repository.
pub fn split_reference(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    match image.rfind(':') {
        Some(idx) if idx + 1 == image.len() => (&image[..idx], "latest"),
        Some(idx) if !image[idx + 1..].contains('/') => (&image[..idx], &image[idx + 1..]),
        _ => (image, "latest"),
    }
}
