// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::future::Future;
use tokio::sync::watch;

/// True once shutdown has been requested or the sender is gone.
pub async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) -> bool {
	match shutdown_rx.changed().await {
		Ok(()) => *shutdown_rx.borrow(),
		Err(_) => true,
	}
}

/// Drives `work` to completion unless shutdown is requested first, in which
/// case `work` is dropped mid-flight and `None` comes back.
pub async fn until_shutdown<F: Future>(
	shutdown_rx: &mut watch::Receiver<bool>,
	work: F,
) -> Option<F::Output> {
	if *shutdown_rx.borrow() {
		return None;
	}
	tokio::pin!(work);
	loop {
		tokio::select! {
			biased;

			stop = shutdown_requested(shutdown_rx) => {
				if stop {
					return None;
				}
			}

			output = &mut work => return Some(output),
		}
	}
}
