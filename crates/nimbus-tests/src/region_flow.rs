//! Health observations driving multi-region routing and failover.
