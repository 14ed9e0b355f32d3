mod device_view;
mod listen_view;
mod painter;
mod spinner;
mod table;

pub(crate) use self::device_view::DeviceTableView;
pub(crate) use self::listen_view::{
    ConnectionStatusView, ListenReadyView, ListenSummaryView, NotificationLineView,
};
pub(crate) use self::painter::Painter;
pub(crate) use self::spinner::Spinner;
