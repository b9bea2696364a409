use std::sync::Arc;

use tokio::sync::mpsc;
use log::{debug, error, info};

use crate::middleware::RequestMiddleware;
use crate::RellmFoot;

/// Public API for the rellm backend - owns the task
pub struct RellmBackend
{   hand: crate::RellmHand
  , _task_handle: tokio::task::JoinHandle<()>
}

impl RellmBackend
{   /// Create and spawn a new backend around `middleware`
    /// Returns immediately - spawns background task
    pub fn new(middleware: Arc<RequestMiddleware>) -> Self
    {   debug!("Creating RellmBackend with task ownership");

        let (process_request_tx, process_request_rx)
          = mpsc::unbounded_channel();
        let (get_recent_performance_tx, get_recent_performance_rx)
          = mpsc::unbounded_channel();
        let (get_model_usage_stats_tx, get_model_usage_stats_rx)
          = mpsc::unbounded_channel();
        let (kill_process_tx, kill_process_rx)
          = mpsc::unbounded_channel();

        let hand = crate::RellmHand
        {   process_request_tx
          , get_recent_performance_tx
          , get_model_usage_stats_tx
          , kill_process_tx
        };

        let foot = crate::RellmFoot
        {   process_request_rx
          , get_recent_performance_rx
          , get_model_usage_stats_rx
          , kill_process_rx
        };

        let _task_handle = tokio::spawn(async move {
          run_backend_loop(foot, middleware).await
        });

        RellmBackend
        {   hand
          , _task_handle
        }
    }

    /// Queue a prompt - returns almost immediately
    pub fn process_request(
      &self
    , prompt: String
    , options: crate::RequestOptions
    ) -> Result<
        mpsc::UnboundedReceiver<crate::ProcessRequestReply>,
        crate::error::Error
      >
    {   debug!("process_request queuing command");
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        let cmd = crate::ProcessRequestArgs
        {   prompt
          , options
          , reply: reply_tx
        };

        self.hand.process_request_tx
          .send(cmd)
          .map_err(|_| disconnected())?;

        Ok(reply_rx)
    }

    /// Ask for rolling-window aggregates
    pub fn get_recent_performance(
      &self
    ) -> Result<
        mpsc::UnboundedReceiver<crate::GetRecentPerformanceReply>,
        crate::error::Error
      >
    {   debug!("get_recent_performance queuing command");
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        self.hand.get_recent_performance_tx
          .send(crate::GetRecentPerformanceArgs { reply: reply_tx })
          .map_err(|_| disconnected())?;

        Ok(reply_rx)
    }

    /// Ask for per-model usage
    pub fn get_model_usage_stats(
      &self
    ) -> Result<
        mpsc::UnboundedReceiver<crate::GetModelUsageStatsReply>,
        crate::error::Error
      >
    {   debug!("get_model_usage_stats queuing command");
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        self.hand.get_model_usage_stats_tx
          .send(crate::GetModelUsageStatsArgs { reply: reply_tx })
          .map_err(|_| disconnected())?;

        Ok(reply_rx)
    }

    /// Gracefully shutdown the backend
    pub async fn shutdown(self)
      -> Result<(), crate::error::Error>
    {   debug!("Shutting down RellmBackend");
        let (reply_tx, mut reply_rx)
          = mpsc::unbounded_channel();

        let cmd = crate::KillProcessArgs
        {   reply: reply_tx
        };

        self.hand.kill_process_tx
          .send(cmd)
          .map_err(|_| {
            error!("Backend channel already closed");
            crate::error::Error::Backend(
              "backend already shutdown".to_string()
            )
          })?;

        // Wait for shutdown confirmation
        if let Some(result) = reply_rx.recv().await
        {   debug!("Backend shutdown confirmed");
            result
        } else
        {   error!("Backend shutdown timeout");
            Err(crate::error::Error::Timeout)
        }
    }
}

fn disconnected() -> crate::error::Error
{   error!("Backend channel closed");
    crate::error::Error::Backend(
      "backend disconnected".to_string()
    )
}

/// Main backend event loop
///
/// tokio::select! only routes. Each request runs on its own task so
/// a slow model call never holds up other requests or queries.
async fn run_backend_loop(
  foot: RellmFoot
, middleware: Arc<RequestMiddleware>
)
{   debug!("Starting RellmBackend event loop");
    let RellmFoot
    {   mut process_request_rx
      , mut get_recent_performance_rx
      , mut get_model_usage_stats_rx
      , mut kill_process_rx
    } = foot;

    loop
    { tokio::select!
      { Some(cmd) = process_request_rx.recv() => {
          debug!("Received ProcessRequest");
          let middleware = middleware.clone();
          tokio::spawn(async move {
            let result = middleware
              .process_request(cmd.prompt, cmd.options)
              .await;
            let _ = cmd.reply.send(result);
          });
        }
      , Some(cmd) = get_recent_performance_rx.recv() => {
          debug!("Received GetRecentPerformance");
          let _ = cmd.reply.send(middleware.recent_performance());
        }
      , Some(cmd) = get_model_usage_stats_rx.recv() => {
          debug!("Received GetModelUsageStats");
          let _ = cmd.reply.send(middleware.model_usage_stats());
        }
      , Some(cmd) = kill_process_rx.recv() => {
          debug!("Received KillProcess");
          let _ = cmd.reply.send(Ok(()));
          info!("RellmBackend shutting down");
          break;
        }
      , else => {
          debug!("All command channels closed");
          break;
        }
      }
    }
}
