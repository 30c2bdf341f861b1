use std::sync::Arc;
use std::time::Duration;

use mqttd_core::{QoS, SubscribeReturnCode};
use mqttd_proto::{Conn, Context, Message, Result};

use crate::options::ClientOptions;

/// A connected MQTT client.
///
/// Wraps one initiated connection plus the context running its reader
/// loop and worker pool. Blocking calls run in the caller's thread;
/// `_async` variants run on a worker and report through a callback.
pub struct Client {
    ctx: Arc<Context>,
    conn: Arc<Conn>,
    opts: ClientOptions,
    owns_ctx: bool,
}

impl Client {
    /// Connects to a broker, blocking until CONNACK or timeout.
    pub fn connect(host: &str, port: u16, opts: ClientOptions) -> Result<Client> {
        let ctx = Context::builder(format!("client/{}", opts.client_id)).build()?;

        match Conn::initiate(&ctx, host, port, opts.to_conn_options()) {
            Ok(conn) => Ok(Client {
                ctx,
                conn,
                opts,
                owns_ctx: true,
            }),
            Err(err) => {
                ctx.shutdown();
                Err(err)
            }
        }
    }

    /// Connects inside an existing context, sharing its reader loop and
    /// worker pool with other clients.
    pub fn connect_with(ctx: &Arc<Context>, host: &str, port: u16, opts: ClientOptions) -> Result<Client> {
        let conn = Conn::initiate(ctx, host, port, opts.to_conn_options())?;

        Ok(Client {
            ctx: Arc::clone(ctx),
            conn,
            opts,
            owns_ctx: false,
        })
    }

    /// Non-blocking connect; the callback receives the connected client
    /// or the failure on a worker thread.
    pub fn connect_async<F>(host: &str, port: u16, opts: ClientOptions, on_connected: F) -> Result<()>
    where
        F: FnOnce(Result<Client>) + Send + 'static,
    {
        let ctx = Context::builder(format!("client/{}", opts.client_id)).build()?;
        let conn_opts = opts.to_conn_options();
        let ctx2 = Arc::clone(&ctx);

        Conn::initiate_async(&ctx, host, port, conn_opts, move |outcome| {
            on_connected(outcome.map(|conn| Client {
                ctx: ctx2,
                conn,
                opts,
                owns_ctx: true,
            }))
        });

        Ok(())
    }

    /// The connection backing this client.
    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    pub fn client_id(&self) -> String {
        self.conn.client_id()
    }

    /// Whether the connection is currently operational.
    pub fn is_ok(&self) -> bool {
        self.conn.is_ok()
    }

    // ---- blocking operations -------------------------------------------

    /// Publishes, waiting out the acknowledgment flow of `qos`.
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<()> {
        self.conn
            .publish(topic, payload, qos, retain, self.opts.operation_timeout)
    }

    /// Subscribes and reports the granted QoS, or the 0x80 refusal.
    pub fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<SubscribeReturnCode> {
        self.conn
            .subscribe(topic_filter, qos, self.opts.operation_timeout)
    }

    pub fn unsubscribe(&self, topic_filter: &str) -> Result<()> {
        self.conn
            .unsubscribe(topic_filter, self.opts.operation_timeout)
    }

    /// Liveness probe over PINGREQ/PINGRESP.
    pub fn ping(&self) -> Result<()> {
        self.conn.ping(self.opts.operation_timeout)
    }

    /// Waits for the next inbound message.
    ///
    /// `Ok(None)` on timeout; `Err(Closed)` once the connection died.
    pub fn recv(&self, timeout: Duration) -> Result<Option<Arc<Message>>> {
        self.conn.get_next(timeout)
    }

    // ---- async operations ----------------------------------------------

    /// Publish on a worker; the callback receives the outcome.
    pub fn publish_async<F>(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool, on_done: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let topic = topic.to_owned();
        let payload = payload.to_vec();
        let wait = self.opts.operation_timeout;

        self.ctx.pool().execute(move || {
            on_done(conn.publish(&topic, &payload, qos, retain, wait));
        });
    }

    /// Subscribe on a worker; the callback receives the granted QoS.
    pub fn subscribe_async<F>(&self, topic_filter: &str, qos: QoS, on_done: F)
    where
        F: FnOnce(Result<SubscribeReturnCode>) + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let topic_filter = topic_filter.to_owned();
        let wait = self.opts.operation_timeout;

        self.ctx.pool().execute(move || {
            on_done(conn.subscribe(&topic_filter, qos, wait));
        });
    }

    // ---- handlers -------------------------------------------------------

    /// Handler for inbound messages; replaces [`Client::recv`]-style
    /// consumption.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Arc<Message>) + Send + Sync + 'static,
    {
        self.conn
            .set_on_message(move |_ctx, _conn, msg| handler(msg));
    }

    /// Appends a close handler; each registered handler fires exactly
    /// once when the connection dies.
    pub fn on_close<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.conn.add_on_close(move |_conn| handler());
    }

    /// Fires after a successful automatic reconnect.
    pub fn on_reconnect<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.conn.set_on_reconnect(move |_conn| handler());
    }

    /// Orderly disconnect: drain, DISCONNECT, tear down.
    pub fn disconnect(self) -> Result<()> {
        self.conn.close();
        if self.owns_ctx {
            self.ctx.shutdown();
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.conn.is_ok() {
            debug!("client `{}` dropped while connected", self.conn.client_id());
            self.conn.close();
        }
        if self.owns_ctx {
            self.ctx.shutdown();
        }
    }
}
