//! 各 API 分组的 REST 路由表

use crate::error::ServeResult;
use crate::server::router::STABLE_PREFIX;

use super::{CallKind, GatewayMux};

/// 分组注册函数
pub type RegisterFn = fn(&mut GatewayMux) -> ServeResult<()>;

/// 网关按顺序注册的全部分组
pub const HANDLERS: &[RegisterFn] = &[
    register_kv_handler,
    register_watch_handler,
    register_lease_handler,
    register_cluster_handler,
    register_maintenance_handler,
    register_auth_handler,
    register_lock_handler,
    register_election_handler,
];

type RouteTable = &'static [(&'static str, &'static str, CallKind)];

const KV: RouteTable = &[
    ("kv/range", "Range", CallKind::Unary),
    ("kv/put", "Put", CallKind::Unary),
    ("kv/deleterange", "DeleteRange", CallKind::Unary),
    ("kv/txn", "Txn", CallKind::Unary),
    ("kv/compaction", "Compact", CallKind::Unary),
];

const WATCH: RouteTable = &[("watch", "Watch", CallKind::Bidi)];

const LEASE: RouteTable = &[
    ("lease/grant", "LeaseGrant", CallKind::Unary),
    ("kv/lease/revoke", "LeaseRevoke", CallKind::Unary),
    ("lease/keepalive", "LeaseKeepAlive", CallKind::Bidi),
    ("kv/lease/timetolive", "LeaseTimeToLive", CallKind::Unary),
    ("kv/lease/leases", "LeaseLeases", CallKind::Unary),
];

const CLUSTER: RouteTable = &[
    ("cluster/member/add", "MemberAdd", CallKind::Unary),
    ("cluster/member/remove", "MemberRemove", CallKind::Unary),
    ("cluster/member/update", "MemberUpdate", CallKind::Unary),
    ("cluster/member/list", "MemberList", CallKind::Unary),
    ("cluster/member/promote", "MemberPromote", CallKind::Unary),
];

const MAINTENANCE: RouteTable = &[
    ("maintenance/alarm", "Alarm", CallKind::Unary),
    ("maintenance/status", "Status", CallKind::Unary),
    ("maintenance/defragment", "Defragment", CallKind::Unary),
    ("maintenance/hash", "Hash", CallKind::Unary),
    ("maintenance/snapshot", "Snapshot", CallKind::ServerStream),
    ("maintenance/transfer-leadership", "MoveLeader", CallKind::Unary),
];

const AUTH: RouteTable = &[
    ("auth/enable", "AuthEnable", CallKind::Unary),
    ("auth/disable", "AuthDisable", CallKind::Unary),
    ("auth/authenticate", "Authenticate", CallKind::Unary),
    ("auth/user/add", "UserAdd", CallKind::Unary),
    ("auth/user/get", "UserGet", CallKind::Unary),
    ("auth/user/list", "UserList", CallKind::Unary),
    ("auth/user/delete", "UserDelete", CallKind::Unary),
    ("auth/user/changepw", "UserChangePassword", CallKind::Unary),
    ("auth/user/grant", "UserGrantRole", CallKind::Unary),
    ("auth/user/revoke", "UserRevokeRole", CallKind::Unary),
    ("auth/role/add", "RoleAdd", CallKind::Unary),
    ("auth/role/get", "RoleGet", CallKind::Unary),
    ("auth/role/list", "RoleList", CallKind::Unary),
    ("auth/role/delete", "RoleDelete", CallKind::Unary),
    ("auth/role/grant", "RoleGrantPermission", CallKind::Unary),
    ("auth/role/revoke", "RoleRevokePermission", CallKind::Unary),
];

const LOCK: RouteTable = &[
    ("lock/lock", "Lock", CallKind::Unary),
    ("lock/unlock", "Unlock", CallKind::Unary),
];

const ELECTION: RouteTable = &[
    ("election/campaign", "Campaign", CallKind::Unary),
    ("election/proclaim", "Proclaim", CallKind::Unary),
    ("election/leader", "Leader", CallKind::Unary),
    ("election/observe", "Observe", CallKind::ServerStream),
    ("election/resign", "Resign", CallKind::Unary),
];

fn register_table(mux: &mut GatewayMux, service: &str, table: RouteTable) -> ServeResult<()> {
    for (path, method, kind) in table {
        mux.handle(
            &format!("{}{}", STABLE_PREFIX, path),
            &format!("/{}/{}", service, method),
            *kind,
        )?;
    }
    Ok(())
}

pub fn register_kv_handler(mux: &mut GatewayMux) -> ServeResult<()> {
    register_table(mux, "etcdserverpb.KV", KV)
}

pub fn register_watch_handler(mux: &mut GatewayMux) -> ServeResult<()> {
    register_table(mux, "etcdserverpb.Watch", WATCH)
}

pub fn register_lease_handler(mux: &mut GatewayMux) -> ServeResult<()> {
    register_table(mux, "etcdserverpb.Lease", LEASE)
}

pub fn register_cluster_handler(mux: &mut GatewayMux) -> ServeResult<()> {
    register_table(mux, "etcdserverpb.Cluster", CLUSTER)
}

pub fn register_maintenance_handler(mux: &mut GatewayMux) -> ServeResult<()> {
    register_table(mux, "etcdserverpb.Maintenance", MAINTENANCE)
}

pub fn register_auth_handler(mux: &mut GatewayMux) -> ServeResult<()> {
    register_table(mux, "etcdserverpb.Auth", AUTH)
}

pub fn register_lock_handler(mux: &mut GatewayMux) -> ServeResult<()> {
    register_table(mux, "v3lockpb.Lock", LOCK)
}

pub fn register_election_handler(mux: &mut GatewayMux) -> ServeResult<()> {
    register_table(mux, "v3electionpb.Election", ELECTION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServeError;
    use crate::server::gateway::JsonPassthrough;
    use crate::server::rpc::{DialCredentials, RpcChannel};
    use crate::utils::logger::Logger;
    use std::sync::Arc;

    fn empty_mux() -> GatewayMux {
        let channel = Arc::new(RpcChannel::new(
            "127.0.0.1:1".parse().unwrap(),
            DialCredentials::Insecure,
            Logger::discard(),
        ));
        GatewayMux::new(channel, Arc::new(JsonPassthrough::default()), Logger::discard())
    }

    #[test]
    fn route_tables_do_not_collide() {
        let mut mux = empty_mux();
        for register in HANDLERS {
            register(&mut mux).unwrap();
        }
        let expected: usize = [KV, WATCH, LEASE, CLUSTER, MAINTENANCE, AUTH, LOCK, ELECTION]
            .iter()
            .map(|table| table.len())
            .sum();
        assert_eq!(mux.len(), expected);
        assert!(mux.paths().all(|path| path.starts_with("/v3beta/")));
        assert_eq!(mux.route("/v3beta/kv/txn").unwrap().method, "/etcdserverpb.KV/Txn");
        assert_eq!(mux.route("/v3beta/lock/unlock").unwrap().method, "/v3lockpb.Lock/Unlock");
    }

    #[test]
    fn registering_a_group_twice_fails() {
        let mut mux = empty_mux();
        register_kv_handler(&mut mux).unwrap();
        assert!(matches!(register_kv_handler(&mut mux), Err(ServeError::RegistrationError(_))));
    }
}
