use std::fmt;

use futures::channel::mpsc::UnboundedSender;
use futures::channel::oneshot;
use futures::executor::ThreadPool;
use futures::future::{self, FutureExt};

use crate::error::{Error, Result};
use crate::server::RpcFuture;

/// One in-flight request travelling from a client end to the network core.
pub struct Rpc {
    pub(crate) client_name: String,
    pub(crate) fq_name: &'static str,
    pub(crate) req: Option<Vec<u8>>,
    pub(crate) resp: Option<oneshot::Sender<Result<Vec<u8>>>>,
}

impl Rpc {
    pub(crate) fn take_resp_sender(&mut self) -> Option<oneshot::Sender<Result<Vec<u8>>>> {
        self.resp.take()
    }
}

impl fmt::Debug for Rpc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Rpc")
            .field("client_name", &self.client_name)
            .field("fq_name", &self.fq_name)
            .finish()
    }
}

/// A named client end. Whether its calls reach anything is decided by the
/// network's connect/enable tables, never by the client itself.
#[derive(Clone)]
pub struct Client {
    // this end's name
    pub(crate) name: String,
    // copy of Network.sender
    pub(crate) sender: UnboundedSender<Rpc>,

    pub worker: ThreadPool,
}

impl Client {
    /// Issues `fq_name` with `req` and resolves to the decoded reply.
    ///
    /// Resolves to `Err` on a dropped request, a dropped reply, a dead or
    /// disconnected server, or a stopped network, but always resolves.
    pub fn call<Req, Rsp>(&self, fq_name: &'static str, req: &Req) -> RpcFuture<Result<Rsp>>
    where
        Req: wirecodec::Message,
        Rsp: wirecodec::Message + 'static,
    {
        let mut buf = vec![];
        if let Err(e) = wirecodec::encode(req, &mut buf) {
            return Box::pin(future::err(Error::Encode(e)));
        }

        let (tx, rx) = oneshot::channel();
        let rpc = Rpc {
            client_name: self.name.clone(),
            fq_name,
            req: Some(buf),
            resp: Some(tx),
        };

        if self.sender.unbounded_send(rpc).is_err() {
            return Box::pin(future::err(Error::Stopped));
        }

        Box::pin(rx.then(|res| async move {
            match res {
                Ok(Ok(resp)) => wirecodec::decode(&resp).map_err(Error::Decode),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(Error::Recv(e)),
            }
        }))
    }
}
