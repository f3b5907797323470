//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod task;
pub mod yang;

use tokio::sync::mpsc;

pub type Sender<T> = mpsc::Sender<T>;
pub type Receiver<T> = mpsc::Receiver<T>;
pub type UnboundedSender<T> = mpsc::UnboundedSender<T>;
pub type UnboundedReceiver<T> = mpsc::UnboundedReceiver<T>;
pub type Responder<T> = tokio::sync::oneshot::Sender<T>;
