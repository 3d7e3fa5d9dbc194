//! Mapping of materialised elements onto typed records

use super::element::Element;
use crate::models::{
    Artist, ArtistCredit, ArtistRef, CatalogRecord, FileType, Format, Image, Label, LabelRef,
    Master, Release, ReleaseLabel, Track, Video,
};

type ConvertResult<T> = Result<T, String>;

pub(crate) fn to_record(file_type: FileType, el: &Element) -> ConvertResult<CatalogRecord> {
    match file_type {
        FileType::Artists => artist(el).map(CatalogRecord::Artist),
        FileType::Labels => label(el).map(CatalogRecord::Label),
        FileType::Masters => master(el).map(CatalogRecord::Master),
        FileType::Releases => release(el).map(CatalogRecord::Release),
    }
}

fn parse_id(raw: Option<&str>, what: &str) -> ConvertResult<i64> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("missing {}", what))?;
    raw.parse::<i64>()
        .map_err(|_| format!("invalid {} '{}'", what, raw))
}

fn opt_num<T: std::str::FromStr>(raw: Option<&str>) -> Option<T> {
    raw.map(str::trim).and_then(|s| s.parse().ok())
}

fn required_text(el: &Element, name: &str) -> ConvertResult<String> {
    el.child_text(name)
        .ok_or_else(|| format!("missing <{}> on <{}>", name, el.name))
}

fn images(el: &Element) -> Vec<Image> {
    el.child("images")
        .map(|images| {
            images
                .children("image")
                .map(|img| Image {
                    kind: img.attr("type").map(str::to_string),
                    uri: img.attr("uri").filter(|u| !u.is_empty()).map(str::to_string),
                    width: opt_num(img.attr("width")),
                    height: opt_num(img.attr("height")),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn artist_refs(el: &Element, outer: &str) -> Vec<ArtistRef> {
    el.child(outer)
        .map(|o| {
            o.children("name")
                .filter_map(|n| {
                    n.text().map(|name| ArtistRef {
                        id: opt_num(n.attr("id")),
                        name,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn credits(el: &Element, outer: &str) -> Vec<ArtistCredit> {
    el.child(outer)
        .map(|o| {
            o.children("artist")
                .filter_map(|a| {
                    a.child_text("name").map(|name| ArtistCredit {
                        id: opt_num(a.child_text("id").as_deref()),
                        name,
                        anv: a.child_text("anv"),
                        join: a.child_text("join"),
                        role: a.child_text("role"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn videos(el: &Element) -> Vec<Video> {
    el.child("videos")
        .map(|o| {
            o.children("video")
                .filter_map(|v| {
                    v.attr("src").map(|src| Video {
                        src: src.to_string(),
                        duration: opt_num(v.attr("duration")),
                        embed: v.attr("embed") == Some("true"),
                        title: v.child_text("title"),
                        description: v.child_text("description"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn artist(el: &Element) -> ConvertResult<Artist> {
    Ok(Artist {
        id: parse_id(el.child_text("id").as_deref(), "artist id")?,
        name: required_text(el, "name")?,
        real_name: el.child_text("realname"),
        profile: el.child_text("profile"),
        data_quality: el.child_text("data_quality"),
        urls: el.list("urls", "url"),
        name_variations: el.list("namevariations", "name"),
        aliases: artist_refs(el, "aliases"),
        members: artist_refs(el, "members"),
        groups: artist_refs(el, "groups"),
        images: images(el),
        content_hash: None,
    })
}

fn label_ref(el: &Element) -> Option<LabelRef> {
    el.text().map(|name| LabelRef {
        id: opt_num(el.attr("id")),
        name,
    })
}

fn label(el: &Element) -> ConvertResult<Label> {
    Ok(Label {
        id: parse_id(el.child_text("id").as_deref(), "label id")?,
        name: required_text(el, "name")?,
        contact_info: el.child_text("contactinfo"),
        profile: el.child_text("profile"),
        data_quality: el.child_text("data_quality"),
        urls: el.list("urls", "url"),
        parent_label: el.child("parentLabel").and_then(label_ref),
        sublabels: el
            .child("sublabels")
            .map(|s| s.children("label").filter_map(label_ref).collect())
            .unwrap_or_default(),
        images: images(el),
        content_hash: None,
    })
}

fn master(el: &Element) -> ConvertResult<Master> {
    Ok(Master {
        id: parse_id(el.attr("id"), "master id")?,
        title: required_text(el, "title")?,
        main_release: opt_num(el.child_text("main_release").as_deref()),
        year: opt_num::<i32>(el.child_text("year").as_deref()).filter(|y| *y > 0),
        data_quality: el.child_text("data_quality"),
        notes: el.child_text("notes"),
        genres: el.list("genres", "genre"),
        styles: el.list("styles", "style"),
        artists: credits(el, "artists"),
        images: images(el),
        videos: videos(el),
        content_hash: None,
    })
}

fn release(el: &Element) -> ConvertResult<Release> {
    let master = el.child("master_id");

    let labels = el
        .child("labels")
        .map(|o| {
            o.children("label")
                .filter_map(|l| {
                    l.attr("name").map(|name| ReleaseLabel {
                        id: opt_num(l.attr("id")),
                        name: name.to_string(),
                        catno: l.attr("catno").filter(|c| !c.is_empty()).map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let formats = el
        .child("formats")
        .map(|o| {
            o.children("format")
                .map(|f| Format {
                    name: f.attr("name").unwrap_or_default().to_string(),
                    qty: f.attr("qty").map(str::to_string),
                    text: f.attr("text").filter(|t| !t.is_empty()).map(str::to_string),
                    descriptions: f.list("descriptions", "description"),
                })
                .collect()
        })
        .unwrap_or_default();

    let tracklist = el
        .child("tracklist")
        .map(|o| {
            o.children("track")
                .map(|t| Track {
                    position: t.child_text("position").unwrap_or_default(),
                    title: t.child_text("title").unwrap_or_default(),
                    duration: t.child_text("duration"),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Release {
        id: parse_id(el.attr("id"), "release id")?,
        status: el.attr("status").map(str::to_string),
        title: required_text(el, "title")?,
        country: el.child_text("country"),
        released: el.child_text("released"),
        notes: el.child_text("notes"),
        data_quality: el.child_text("data_quality"),
        master_id: master.and_then(|m| opt_num(m.text().as_deref())),
        is_main_release: master.and_then(|m| m.attr("is_main_release")) == Some("true"),
        genres: el.list("genres", "genre"),
        styles: el.list("styles", "style"),
        artists: credits(el, "artists"),
        extra_artists: credits(el, "extraartists"),
        labels,
        formats,
        tracklist,
        images: images(el),
        videos: videos(el),
        content_hash: None,
    })
}
