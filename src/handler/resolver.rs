use super::{HandleError, Handler, ReplyStrategy};
use crate::platform::{Forwarder, PlatformClient, SendError};
use crate::registry::{MessageContext, Registry};
use crate::reply::{parse_reply_xml, render_xml, Reply, ReplyBody};
use crate::security::signature::unix_now;
use rand::RngExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Synchronous answer to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedReply {
    /// A passive reply document rendered locally.
    Xml(String),
    /// Bytes returned by a forward endpoint, relayed as-is.
    Forwarded(Vec<u8>),
}

impl RenderedReply {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Xml(xml) => xml.into_bytes(),
            Self::Forwarded(bytes) => bytes,
        }
    }
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub reply: Option<RenderedReply>,
    /// Out-of-band sends still in flight. Dropping the handles detaches them.
    pub background: Vec<JoinHandle<()>>,
}

/// Turns a matched handler into a reply according to its strategy.
#[derive(Clone)]
pub struct ReplyResolver {
    registry: Arc<Registry>,
    platform: Arc<dyn PlatformClient>,
    forwarder: Forwarder,
    send_timeout: Duration,
}

impl ReplyResolver {
    pub fn new(
        registry: Arc<Registry>,
        platform: Arc<dyn PlatformClient>,
        forwarder: Forwarder,
        send_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            platform,
            forwarder,
            send_timeout,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn resolve(
        &self,
        handler: &Handler,
        ctx: &Arc<MessageContext>,
    ) -> Result<Resolution, HandleError> {
        let replies: Vec<&Reply> = handler.replies().collect();
        match handler.strategy {
            ReplyStrategy::None => Ok(Resolution::default()),
            ReplyStrategy::RandomOne => {
                if replies.is_empty() {
                    return Ok(Resolution::default());
                }
                let pick = rand::rng().random_range(0..replies.len());
                Ok(Resolution {
                    reply: self.render(replies[pick], ctx).await?,
                    background: Vec::new(),
                })
            }
            ReplyStrategy::ReplyAll => {
                let Some((first, rest)) = replies.split_first() else {
                    return Ok(Resolution::default());
                };
                let background = rest
                    .iter()
                    .map(|reply| self.spawn_send((*reply).clone(), Arc::clone(ctx)))
                    .collect();
                let reply = self.render(first, ctx).await?;
                Ok(Resolution { reply, background })
            }
        }
    }

    /// Renders `reply` as the synchronous response to `ctx`.
    pub async fn render(
        &self,
        reply: &Reply,
        ctx: &MessageContext,
    ) -> Result<Option<RenderedReply>, HandleError> {
        if let Reply::Forward { url } = reply {
            let bytes = self.forwarder.forward(url, &ctx.query, &ctx.body).await?;
            return Ok((!bytes.is_empty()).then_some(RenderedReply::Forwarded(bytes)));
        }

        let Some(body) = self.reply_body(reply, ctx).await? else {
            return Ok(None);
        };
        Ok(Some(RenderedReply::Xml(render_xml(
            &body,
            &ctx.message.source,
            &ctx.message.target,
            unix_now(),
        ))))
    }

    /// Produces the addressed reply body for `reply`, running programs and
    /// forward calls where needed.
    async fn reply_body(
        &self,
        reply: &Reply,
        ctx: &MessageContext,
    ) -> Result<Option<ReplyBody>, HandleError> {
        match reply {
            Reply::Message(body) => Ok((!body.is_empty()).then(|| body.clone())),
            Reply::Custom { program } => {
                let runner = self.registry.program(program, &ctx.account).map_err(|source| {
                    HandleError::UnresolvableCustomProgram {
                        name: program.clone(),
                        source,
                    }
                })?;
                let output = runner.run(ctx).await.map_err(|err| HandleError::Program {
                    name: program.clone(),
                    message: format!("{err:#}"),
                })?;
                Ok(output.into_reply())
            }
            Reply::Forward { url } => {
                let bytes = self.forwarder.forward(url, &ctx.query, &ctx.body).await?;
                parse_reply_xml(&bytes).map_err(HandleError::UnreadableForwardReply)
            }
        }
    }

    /// Renders and delivers one out-of-band reply. `send_timeout` bounds the
    /// whole task, program runs and forward calls included.
    async fn send(&self, reply: &Reply, ctx: &MessageContext) -> Result<(), HandleError> {
        let deliver = async {
            let Some(body) = self.reply_body(reply, ctx).await? else {
                return Ok(());
            };
            self.platform
                .send_direct_message(&ctx.account, &ctx.message.source, &body)
                .await?;
            Ok::<(), HandleError>(())
        };
        tokio::time::timeout(self.send_timeout, deliver)
            .await
            .map_err(|_| SendError::Timeout)?
    }

    fn spawn_send(&self, reply: Reply, ctx: Arc<MessageContext>) -> JoinHandle<()> {
        let resolver = self.clone();
        let task = async move {
            match resolver.send(&reply, &ctx).await {
                Ok(()) => tracing::debug!(reply = reply.kind(), "out-of-band reply sent"),
                Err(err) => tracing::warn!(reply = reply.kind(), "out-of-band reply failed: {err}"),
            }
        };
        tokio::spawn(task.instrument(tracing::Span::current()))
    }
}
