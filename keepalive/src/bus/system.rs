// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words zbus zvariant

//! Production [`BusLink`] over the platform system bus, backed by `zbus`.
//!
//! This is the only module that touches the wire; everything above the
//! [`BusLink`] seam deals in [`BusValue`]s. Calls are issued dynamically
//! (no generated proxies — the handful of daemon methods does not warrant
//! them) and signal matches are installed through `zbus` match rules whose
//! lifetime is tied to the returned channel.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{BusConnector, BusError, BusLink, BusValue, MethodCall, ReplyType, SignalMatch,
            SignalMessage};

/// Connects to the system-wide message bus.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBus;

#[async_trait]
impl BusConnector for SystemBus {
    async fn connect(&self) -> Result<Arc<dyn BusLink>, BusError> {
        let conn = zbus::Connection::system().await.map_err(transport)?;
        Ok(Arc::new(SystemBusLink { conn }))
    }
}

/// One live system-bus connection.
#[derive(Debug, Clone)]
pub struct SystemBusLink {
    conn: zbus::Connection,
}

fn transport(error: zbus::Error) -> BusError {
    match error {
        zbus::Error::MethodError(name, message, _reply) => BusError::Method {
            name: name.to_string(),
            message: message.unwrap_or_default(),
        },
        other => BusError::Transport(other.to_string()),
    }
}

impl SystemBusLink {
    async fn dispatch(&self, call: &MethodCall) -> zbus::Result<zbus::message::Message> {
        let MethodCall { service, object, interface, method, args } = call;
        match args.as_slice() {
            [] => {
                self.conn
                    .call_method(Some(*service), *object, Some(*interface), *method, &())
                    .await
            }
            [BusValue::Str(v)] => {
                self.conn
                    .call_method(Some(*service),
                                 *object,
                                 Some(*interface),
                                 *method,
                                 &(v.as_str(),))
                    .await
            }
            [BusValue::Bool(v)] => {
                self.conn
                    .call_method(Some(*service), *object, Some(*interface), *method, &(*v,))
                    .await
            }
            [BusValue::I32(v)] => {
                self.conn
                    .call_method(Some(*service), *object, Some(*interface), *method, &(*v,))
                    .await
            }
            _ => Err(zbus::Error::Failure("unsupported argument shape".into())),
        }
    }
}

#[async_trait]
impl BusLink for SystemBusLink {
    fn is_connected(&self) -> bool {
        // A zbus connection stays usable until dropped; a broken socket
        // surfaces as errors on the individual operations instead.
        true
    }

    async fn call(&self, call: MethodCall, reply: ReplyType) -> Result<BusValue, BusError> {
        debug!("calling method: {}.{}", call.interface, call.method);
        let msg = self.dispatch(&call).await.map_err(transport)?;
        let body = msg.body();
        match reply {
            ReplyType::Str => body.deserialize::<String>()
                                  .map(BusValue::Str)
                                  .map_err(|e| BusError::BadReply(e.to_string())),
            ReplyType::Bool => body.deserialize::<bool>()
                                   .map(BusValue::Bool)
                                   .map_err(|e| BusError::BadReply(e.to_string())),
            ReplyType::I32 => body.deserialize::<i32>()
                                  .map(BusValue::I32)
                                  .map_err(|e| BusError::BadReply(e.to_string())),
        }
    }

    async fn send(&self, call: MethodCall) -> Result<(), BusError> {
        debug!("calling method: {}.{} (no reply)", call.interface, call.method);
        let builder = zbus::message::Message::method_call(call.object, call.method)
            .map_err(transport)?
            .destination(call.service)
            .map_err(transport)?
            .interface(call.interface)
            .map_err(transport)?
            .with_flags(zbus::message::Flags::NoReplyExpected)
            .map_err(transport)?;
        let msg = match call.args.as_slice() {
            [] => builder.build(&()),
            [BusValue::Str(v)] => builder.build(&(v.as_str(),)),
            [BusValue::Bool(v)] => builder.build(&(*v,)),
            [BusValue::I32(v)] => builder.build(&(*v,)),
            _ => Err(zbus::Error::Failure("unsupported argument shape".into())),
        }
        .map_err(transport)?;
        self.conn.send(&msg).await.map_err(transport)
    }

    async fn subscribe(&self,
                       matcher: SignalMatch)
                       -> Result<mpsc::UnboundedReceiver<SignalMessage>, BusError> {
        let mut builder = zbus::MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .path(matcher.path)
            .map_err(transport)?
            .interface(matcher.interface)
            .map_err(transport)?
            .member(matcher.member)
            .map_err(transport)?;
        if let Some(sender) = matcher.sender {
            builder = builder.sender(sender).map_err(transport)?;
        }
        if let Some(arg0) = matcher.arg0 {
            builder = builder.arg(0, arg0).map_err(transport)?;
        }
        let rule = builder.build();

        let mut stream = zbus::MessageStream::for_match_rule(rule, &self.conn, Some(16))
            .await
            .map_err(transport)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Receiver gone: drop the stream so the match rule is
                    // removed from the bus.
                    () = tx.closed() => break,
                    next = stream.next() => match next {
                        Some(Ok(msg)) => {
                            if let Some(signal) = parse_signal(&msg) {
                                if tx.send(signal).is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Err(_)) => continue,
                        None => break,
                    },
                }
            }
        });
        Ok(rx)
    }
}

/// Decodes a signal body into [`BusValue`]s. Only the shapes the power
/// daemon and bus service actually emit are understood; anything else is
/// delivered with empty arguments and rejected by the per-signal parsers.
fn parse_signal(msg: &zbus::message::Message) -> Option<SignalMessage> {
    let header = msg.header();
    let member = header.member()?.as_str().to_owned();
    let body = msg.body();
    let args = if let Ok((a, b, c)) = body.deserialize::<(String, String, String)>() {
        vec![BusValue::Str(a), BusValue::Str(b), BusValue::Str(c)]
    } else if let Ok(v) = body.deserialize::<String>() {
        vec![BusValue::Str(v)]
    } else if let Ok(v) = body.deserialize::<bool>() {
        vec![BusValue::Bool(v)]
    } else if let Ok(v) = body.deserialize::<i32>() {
        vec![BusValue::I32(v)]
    } else {
        Vec::new()
    };
    Some(SignalMessage { member, args })
}
